use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, Bytes, Log as PrimitiveLog},
    rpc::types::Log,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_tungstenite::tungstenite;

use crate::{
    ConnectionError,
    event_source::{ClientFactory, EventSource},
    transport::{Connection, ReadyState, Socket, SocketEvent, Transport},
    types::{Event, EventCallback, EventSelector, LogQuery, Subscription},
};

/// Builds a log emitted by `address` at `block_number`.
#[must_use]
pub fn log_at(address: Address, block_number: u64, log_index: u64) -> Log {
    Log {
        inner: PrimitiveLog::new_unchecked(address, vec![], Bytes::new()),
        block_number: Some(block_number),
        log_index: Some(log_index),
        ..Default::default()
    }
}

/// In-memory [`Socket`] that records what the code under test does to it.
#[derive(Debug)]
pub struct MockSocket {
    closed: AtomicBool,
    auto_pong: AtomicBool,
    events: mpsc::UnboundedSender<SocketEvent>,
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    sent: Mutex<Vec<String>>,
    pings: AtomicUsize,
    terminations: AtomicUsize,
    closes: AtomicUsize,
}

impl MockSocket {
    /// Creates an open socket and the [`Connection`] a transport would hand out for it.
    #[must_use]
    pub fn pair() -> (Arc<MockSocket>, Connection<MockSocket>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(MockSocket {
            closed: AtomicBool::new(false),
            auto_pong: AtomicBool::new(false),
            events: events_tx,
            inbound: Mutex::new(Some(inbound_tx)),
            sent: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        let connection =
            Connection { socket: socket.clone(), events: events_rx, inbound: inbound_rx };
        (socket, connection)
    }

    /// Answers every ping with a pong.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Delivers a text frame as if the peer had sent it.
    pub fn push_frame(&self, frame: String) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Emits a pong notification.
    pub fn pong(&self) {
        let _ = self.events.send(SocketEvent::Pong);
    }

    /// Emits an error notification without closing the socket.
    pub fn emit_error(&self, error: &str) {
        let _ = self.events.send(SocketEvent::Error(error.to_owned()));
    }

    /// Closes the socket from the peer's side.
    pub fn close(&self, reason: &str) {
        self.finish(Some(1006), reason);
    }

    fn finish(&self, code: Option<u16>, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inbound.lock().unwrap().take();
        let _ = self.events.send(SocketEvent::Close { code, reason: reason.to_owned() });
    }

    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Number of `terminate()` calls, including no-op calls on a closed socket.
    #[must_use]
    pub fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Number of times the socket actually transitioned to closed (0 or 1).
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Socket for MockSocket {
    fn ready_state(&self) -> ReadyState {
        if self.is_closed() { ReadyState::Closed } else { ReadyState::Open }
    }

    fn send(&self, text: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn ping(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.auto_pong.load(Ordering::SeqCst) {
            self.pong();
        }
        Ok(())
    }

    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.finish(None, "terminated");
    }
}

/// [`Transport`] handing out [`MockSocket`]s, recording every open attempt.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<TransportState>,
}

#[derive(Debug)]
struct TransportState {
    reachable: AtomicBool,
    auto_pong: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
    sockets: Mutex<Vec<Arc<MockSocket>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A reachable endpoint whose sockets answer pings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransportState {
                reachable: AtomicBool::new(true),
                auto_pong: AtomicBool::new(true),
                attempts: Mutex::new(Vec::new()),
                sockets: Mutex::new(Vec::new()),
            }),
        }
    }

    /// An endpoint that refuses every connection.
    #[must_use]
    pub fn unreachable() -> Self {
        let transport = Self::new();
        transport.set_reachable(false);
        transport
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Whether sockets opened from now on answer pings.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.inner.attempts.lock().unwrap().len()
    }

    #[must_use]
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.inner.attempts.lock().unwrap().clone()
    }

    /// Sockets opened so far, oldest first.
    #[must_use]
    pub fn sockets(&self) -> Vec<Arc<MockSocket>> {
        self.inner.sockets.lock().unwrap().clone()
    }

    #[must_use]
    pub fn last_socket(&self) -> Option<Arc<MockSocket>> {
        self.inner.sockets.lock().unwrap().last().cloned()
    }
}

impl Transport for MockTransport {
    type Socket = MockSocket;

    async fn open(&self, _endpoint: &str) -> Result<Connection<MockSocket>, ConnectionError> {
        self.inner.attempts.lock().unwrap().push(Instant::now());
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(tungstenite::Error::ConnectionClosed.into());
        }
        let (socket, connection) = MockSocket::pair();
        socket.set_auto_pong(self.inner.auto_pong.load(Ordering::SeqCst));
        self.inner.sockets.lock().unwrap().push(socket);
        Ok(connection)
    }
}

/// Node state shared by every [`MockClient`] built from the same factory.
#[derive(Debug, Clone)]
pub struct MockChain {
    inner: Arc<ChainState>,
}

#[derive(Debug)]
struct ChainState {
    block_number: AtomicU64,
    ready: AtomicBool,
    block_number_fails: AtomicBool,
    logs: Mutex<Vec<Log>>,
    failing_addresses: Mutex<HashSet<Address>>,
    failing_selectors: Mutex<HashSet<EventSelector>>,
    subscribe_delay: Mutex<Duration>,
    max_block_range: Mutex<Option<u64>>,
    log_queries: Mutex<Vec<LogQuery>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChainState {
                block_number: AtomicU64::new(0),
                ready: AtomicBool::new(true),
                block_number_fails: AtomicBool::new(false),
                logs: Mutex::new(Vec::new()),
                failing_addresses: Mutex::new(HashSet::new()),
                failing_selectors: Mutex::new(HashSet::new()),
                subscribe_delay: Mutex::new(Duration::ZERO),
                max_block_range: Mutex::new(None),
                log_queries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.inner.block_number.store(block_number, Ordering::SeqCst);
    }

    /// Advances the head by `blocks` and returns the new head.
    pub fn mine(&self, blocks: u64) -> u64 {
        self.inner.block_number.fetch_add(blocks, Ordering::SeqCst) + blocks
    }

    #[must_use]
    pub fn block_number(&self) -> u64 {
        self.inner.block_number.load(Ordering::SeqCst)
    }

    /// Records a log emitted by `address` in the current head block and returns it.
    pub fn emit_log(&self, address: Address) -> Log {
        let mut logs = self.inner.logs.lock().unwrap();
        let log = log_at(address, self.block_number(), logs.len() as u64);
        logs.push(log.clone());
        log
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::SeqCst);
    }

    pub fn fail_block_number(&self, fail: bool) {
        self.inner.block_number_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logs_for(&self, address: Address, fail: bool) {
        let mut failing = self.inner.failing_addresses.lock().unwrap();
        if fail {
            failing.insert(address);
        } else {
            failing.remove(&address);
        }
    }

    pub fn fail_subscribe_for(&self, selector: EventSelector, fail: bool) {
        let mut failing = self.inner.failing_selectors.lock().unwrap();
        if fail {
            failing.insert(selector);
        } else {
            failing.remove(&selector);
        }
    }

    /// Makes every `on` call take `delay` before answering.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.inner.subscribe_delay.lock().unwrap() = delay;
    }

    /// Rejects `getLogs` queries spanning more than `blocks` blocks, as range-limited nodes do.
    pub fn set_max_block_range(&self, blocks: Option<u64>) {
        *self.inner.max_block_range.lock().unwrap() = blocks;
    }

    /// Every `getLogs` query received so far, in order.
    #[must_use]
    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.inner.log_queries.lock().unwrap().clone()
    }
}

/// [`ClientFactory`] building [`MockClient`]s over any socket.
#[derive(Debug, Clone, Default)]
pub struct MockClientFactory {
    chain: MockChain,
    clients: Arc<Mutex<Vec<MockClient>>>,
}

impl MockClientFactory {
    #[must_use]
    pub fn new(chain: MockChain) -> Self {
        Self { chain, clients: Arc::default() }
    }

    #[must_use]
    pub fn chain(&self) -> &MockChain {
        &self.chain
    }

    /// Clients built so far, oldest first.
    #[must_use]
    pub fn clients(&self) -> Vec<MockClient> {
        self.clients.lock().unwrap().clone()
    }

    #[must_use]
    pub fn last_client(&self) -> Option<MockClient> {
        self.clients.lock().unwrap().last().cloned()
    }
}

impl<S: Socket> ClientFactory<S> for MockClientFactory {
    type Client = MockClient;

    fn build(
        &self,
        _socket: Arc<S>,
        _inbound: mpsc::UnboundedReceiver<String>,
        _chain_id: Option<u64>,
    ) -> Result<MockClient, ConnectionError> {
        let client = MockClient::new(self.chain.clone());
        self.clients.lock().unwrap().push(client.clone());
        Ok(client)
    }
}

/// [`EventSource`] backed by a [`MockChain`].
#[derive(Debug, Clone)]
pub struct MockClient {
    chain: MockChain,
    state: Arc<ClientState>,
}

#[derive(Debug, Default)]
struct ClientState {
    subscribe_calls: Mutex<Vec<EventSelector>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MockClient {
    #[must_use]
    pub fn new(chain: MockChain) -> Self {
        Self { chain, state: Arc::default() }
    }

    /// Selectors passed to `on`, in call order, including failed calls.
    #[must_use]
    pub fn subscribe_calls(&self) -> Vec<EventSelector> {
        self.state.subscribe_calls.lock().unwrap().clone()
    }

    /// Selectors currently subscribed on this client.
    #[must_use]
    pub fn active_selectors(&self) -> Vec<EventSelector> {
        self.state.subscriptions.lock().unwrap().iter().map(|sub| sub.selector).collect()
    }

    /// Pushes `event` to every live subscription on `selector`, as the node's stream would.
    pub fn emit(&self, selector: EventSelector, event: &Event) {
        let subscriptions: Vec<Subscription> = self
            .state
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|sub| sub.selector == selector)
            .cloned()
            .collect();
        for subscription in subscriptions {
            subscription.deliver(event);
        }
    }
}

impl EventSource for MockClient {
    fn is_ready(&self) -> Result<bool, ConnectionError> {
        Ok(self.chain.inner.ready.load(Ordering::SeqCst))
    }

    async fn get_block_number(&self) -> Result<u64, ConnectionError> {
        if self.chain.inner.block_number_fails.load(Ordering::SeqCst) {
            return Err(ConnectionError::Rpc { code: -32000, message: "header not found".into() });
        }
        Ok(self.chain.block_number())
    }

    async fn get_logs(&self, query: LogQuery) -> Result<Vec<Log>, ConnectionError> {
        self.chain.inner.log_queries.lock().unwrap().push(query);
        if self.chain.inner.failing_addresses.lock().unwrap().contains(&query.address) {
            return Err(ConnectionError::Rpc { code: -32005, message: "query timeout".into() });
        }
        let limit = *self.chain.inner.max_block_range.lock().unwrap();
        if limit.is_some_and(|limit| query.to_block - query.from_block + 1 > limit) {
            return Err(ConnectionError::Rpc {
                code: -32005,
                message: "block range too large".into(),
            });
        }
        let logs = self.chain.inner.logs.lock().unwrap();
        Ok(logs
            .iter()
            .filter(|log| log.address() == query.address)
            .filter(|log| {
                log.block_number
                    .is_some_and(|block| block >= query.from_block && block <= query.to_block)
            })
            .cloned()
            .collect())
    }

    async fn on(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> Result<(), ConnectionError> {
        self.state.subscribe_calls.lock().unwrap().push(selector);
        let delay = *self.chain.inner.subscribe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.chain.inner.failing_selectors.lock().unwrap().contains(&selector) {
            return Err(ConnectionError::Rpc { code: -32601, message: "subscribe failed".into() });
        }
        self.state.subscriptions.lock().unwrap().push(Subscription::new(selector, callback));
        Ok(())
    }

    async fn off(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> Result<(), ConnectionError> {
        self.state.subscriptions.lock().unwrap().retain(|sub| !sub.is(&selector, &callback));
        Ok(())
    }
}
