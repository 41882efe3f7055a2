use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    ConnectionError,
    connection::{
        ConnectionConfig, Generation, SubscriptionRegistry, Watermark,
        poller::{EventPoller, PollSettings},
        watchdog::KeepAliveWatchdog,
    },
    event_source::{ClientFactory, EventSource},
    transport::{Connection, ReadyState, Socket, SocketEvent, Transport},
    types::ConnectionState,
};

/// How often the handshake wait re-checks client readiness.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Background task owning the socket of one [`ResilientProvider`](crate::ResilientProvider).
///
/// Every attempt opens a socket, arms the watchdog, waits for the client handshake, replays the
/// registry and starts the poller. A close tears all of that down, waits the reconnect delay and
/// tries again until `max_reconnect_attempts` consecutive attempts fail.
pub(crate) struct ReconnectionController<T: Transport, F: ClientFactory<T::Socket>> {
    endpoint: Arc<str>,
    config: ConnectionConfig,
    transport: T,
    factory: F,
    registry: SubscriptionRegistry,
    watermark: Watermark,
    state: watch::Sender<ConnectionState>,
    client: watch::Sender<Option<Arc<F::Client>>>,
    shutdown: CancellationToken,
    generation: Generation,
    attempts: usize,
    socket: Option<Arc<T::Socket>>,
    watchdog: KeepAliveWatchdog,
    poller: EventPoller,
}

impl<T, F> ReconnectionController<T, F>
where
    T: Transport,
    F: ClientFactory<T::Socket>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint: Arc<str>,
        config: ConnectionConfig,
        transport: T,
        factory: F,
        registry: SubscriptionRegistry,
        watermark: Watermark,
        state: watch::Sender<ConnectionState>,
        client: watch::Sender<Option<Arc<F::Client>>>,
        shutdown: CancellationToken,
    ) -> Self {
        let watchdog = KeepAliveWatchdog::new(config.probe_interval, config.pong_timeout);
        let poller = EventPoller::new(
            config.poll_interval,
            PollSettings {
                call_timeout: config.call_timeout,
                max_block_range: config.max_block_range,
            },
        );
        Self {
            endpoint,
            config,
            transport,
            factory,
            registry,
            watermark,
            state,
            client,
            shutdown,
            generation: Generation::default(),
            attempts: 0,
            socket: None,
            watchdog,
            poller,
        }
    }

    /// Drives the connection until retries are exhausted or shutdown is requested.
    ///
    /// `ready` resolves with `Ok` when the first client is ready, or with the terminal error if
    /// that never happens.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<(), ConnectionError>>) {
        let mut ready = Some(ready);
        let shutdown = self.shutdown.clone();

        info!(endpoint = %self.endpoint, "Connection controller started");

        let reason = loop {
            if self.attempts >= self.config.max_reconnect_attempts {
                error!(
                    endpoint = %self.endpoint,
                    attempts = self.attempts,
                    "Reconnection attempts exhausted"
                );
                break ConnectionError::RetriesExhausted { attempts: self.attempts };
            }

            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                biased;
                () = shutdown.cancelled() => break ConnectionError::Shutdown,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok(mut events) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }

                    let closed = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => None,
                        reason = self.supervise(&mut events) => Some(reason),
                    };
                    self.teardown();

                    let Some(reason) = closed else {
                        break ConnectionError::Shutdown;
                    };
                    warn!(endpoint = %self.endpoint, reason = %reason, "Socket closed");
                }
                Err(e) => {
                    self.teardown();
                    warn!(
                        endpoint = %self.endpoint,
                        attempt = self.attempts + 1,
                        error = %e,
                        "Connection attempt failed"
                    );
                }
            }

            self.set_state(ConnectionState::Closed);
            self.attempts += 1;
            if self.attempts >= self.config.max_reconnect_attempts {
                continue;
            }

            info!(
                endpoint = %self.endpoint,
                attempt = self.attempts + 1,
                delay_ms = self.config.reconnect_delay.as_millis(),
                "Scheduling reconnection"
            );
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break ConnectionError::Shutdown,
                () = sleep(self.config.reconnect_delay) => {}
            }
        };

        self.teardown();
        self.set_state(ConnectionState::Terminated);
        info!(endpoint = %self.endpoint, reason = %reason, "Connection terminated");

        if let Some(ready) = ready.take() {
            let _ = ready.send(Err(reason));
        }
    }

    /// One attempt: open, arm the watchdog, handshake, replay, publish, start polling.
    ///
    /// On success returns the socket's event channel for [`Self::supervise`].
    async fn establish(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<SocketEvent>, ConnectionError> {
        let guard = self.generation.advance();
        debug!(endpoint = %self.endpoint, generation = guard.id(), "Opening socket");

        let Connection { socket, mut events, inbound } =
            timeout(self.config.ready_timeout, self.transport.open(&self.endpoint)).await??;
        self.socket = Some(socket.clone());

        // a socket that opened counts as a successful attempt
        self.attempts = 0;
        self.set_state(ConnectionState::Open);
        self.watchdog.start(socket.clone(), guard.clone());
        info!(endpoint = %self.endpoint, generation = guard.id(), "Socket open");

        let client = Arc::new(self.factory.build(socket.clone(), inbound, self.config.chain_id)?);
        self.wait_until_ready(socket.as_ref(), client.as_ref(), &mut events).await?;

        // replay can take many round trips, keep answering the watchdog meanwhile
        let (report, ()) = {
            let replay = self.registry.replay_then(client.as_ref(), || {
                self.client.send_replace(Some(client.clone()));
            });
            tokio::pin!(replay);
            loop {
                tokio::select! {
                    outcome = &mut replay => break outcome,
                    event = events.recv() => self.handshake_event(event)?,
                }
            }
        };
        info!(
            endpoint = %self.endpoint,
            replayed = report.replayed,
            failed = report.failed,
            "Client ready, subscriptions replayed"
        );

        self.poller.start(client, self.registry.clone(), self.watermark.clone(), guard);
        Ok(events)
    }

    /// Waits for the socket to be open and the client to report readiness.
    async fn wait_until_ready(
        &self,
        socket: &T::Socket,
        client: &F::Client,
        events: &mut mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Result<(), ConnectionError> {
        let deadline = sleep(self.config.ready_timeout);
        tokio::pin!(deadline);

        loop {
            if socket.ready_state() == ReadyState::Open && client.is_ready()? {
                return Ok(());
            }

            tokio::select! {
                () = &mut deadline => {
                    return Err(ConnectionError::NotReady(self.config.ready_timeout));
                }
                () = sleep(READY_POLL_INTERVAL) => {}
                event = events.recv() => self.handshake_event(event)?,
            }
        }
    }

    /// Handles a socket event that arrives before the client is published.
    fn handshake_event(&self, event: Option<SocketEvent>) -> Result<(), ConnectionError> {
        match event {
            Some(SocketEvent::Pong) => self.watchdog.pong(),
            Some(SocketEvent::Error(e)) => {
                warn!(endpoint = %self.endpoint, error = %e, "Socket error during handshake");
            }
            Some(SocketEvent::Close { .. }) | None => return Err(ConnectionError::Closed),
        }
        Ok(())
    }

    /// Handles socket events until the socket closes, returning the close reason.
    async fn supervise(&self, events: &mut mpsc::UnboundedReceiver<SocketEvent>) -> String {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Pong => self.watchdog.pong(),
                SocketEvent::Error(e) => {
                    error!(endpoint = %self.endpoint, error = %e, "Socket error");
                }
                SocketEvent::Close { code, reason } => {
                    debug!(endpoint = %self.endpoint, code = ?code, "Close frame received");
                    return reason;
                }
            }
        }
        "event channel closed".to_owned()
    }

    /// Stops every timer and task of the current socket and closes it.
    fn teardown(&mut self) {
        self.generation.advance();
        self.watchdog.stop();
        self.poller.stop();
        self.client.send_replace(None);
        if let Some(socket) = self.socket.take() {
            socket.terminate();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(endpoint = %self.endpoint, state = ?state, "Connection state changed");
        }
    }
}
