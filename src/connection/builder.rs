use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    ConnectionError,
    connection::{
        ResilientProvider, SubscriptionRegistry, Watermark, controller::ReconnectionController,
    },
    event_source::{ClientFactory, JsonRpcClientFactory},
    transport::{Transport, WsTransport},
    types::{ConnectionState, EventCallback, EventSelector, Subscription},
};

// keep-alive
/// Default interval between liveness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);
/// Default time a probe waits for its pong before the socket is terminated.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(15);

// reconnection
/// Default number of consecutive failed attempts after which the connection terminates.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: usize = 10;
/// Default flat delay between a close and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Default upper bound on opening a socket and on the client handshake.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

// polling fallback
/// Default interval between polling cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Default widest block range of a single polling `getLogs` query.
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 1000;

// RPC retry and timeout settings
/// Default timeout of a single RPC call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default maximum number of retry attempts of a call made through the facade.
pub const DEFAULT_MAX_RETRIES: usize = 3;
/// Default base delay between retries.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Settings of one resilient connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub probe_interval: Duration,
    pub pong_timeout: Duration,
    pub max_reconnect_attempts: usize,
    pub reconnect_delay: Duration,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub max_block_range: u64,
    pub call_timeout: Duration,
    pub max_retries: usize,
    pub min_delay: Duration,
    /// Chain id the node must report; `None` accepts any chain.
    pub chain_id: Option<u64>,
    /// Block the polling fallback starts after; `None` records the head on the first cycle.
    pub start_block: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_DELAY,
            chain_id: None,
            start_block: None,
        }
    }
}

impl ConnectionConfig {
    /// Checks the settings a running controller cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidConfig`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.max_reconnect_attempts == 0 {
            return Err(ConnectionError::InvalidConfig("max_reconnect_attempts must be positive"));
        }
        if self.probe_interval.is_zero() {
            return Err(ConnectionError::InvalidConfig("probe_interval must be positive"));
        }
        if self.pong_timeout.is_zero() {
            return Err(ConnectionError::InvalidConfig("pong_timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConnectionError::InvalidConfig("poll_interval must be positive"));
        }
        if self.max_block_range == 0 {
            return Err(ConnectionError::InvalidConfig("max_block_range must be positive"));
        }
        if self.ready_timeout.is_zero() {
            return Err(ConnectionError::InvalidConfig("ready_timeout must be positive"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConnectionError::InvalidConfig("call_timeout must be positive"));
        }
        Ok(())
    }
}

/// Builder for constructing a [`ResilientProvider`].
///
/// [`ResilientProviderBuilder::new`] connects over WebSockets with the JSON-RPC client;
/// [`ResilientProviderBuilder::with_transport`] plugs in any [`Transport`] and [`ClientFactory`].
#[derive(Debug)]
pub struct ResilientProviderBuilder<T = WsTransport, F = JsonRpcClientFactory> {
    endpoint: String,
    transport: T,
    factory: F,
    config: ConnectionConfig,
    subscriptions: Vec<Subscription>,
}

impl ResilientProviderBuilder {
    /// Create a builder for a `ws://` or `wss://` endpoint with default settings.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_transport(endpoint, WsTransport, JsonRpcClientFactory)
    }
}

impl<T, F> ResilientProviderBuilder<T, F>
where
    T: Transport,
    F: ClientFactory<T::Socket>,
{
    /// Create a builder that opens sockets with `transport` and builds clients with `factory`.
    #[must_use]
    pub fn with_transport(endpoint: impl Into<String>, transport: T, factory: F) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            factory,
            config: ConnectionConfig::default(),
            subscriptions: Vec::new(),
        }
    }

    /// Register a subscription before connecting.
    ///
    /// Pre-registered subscriptions are issued on the first client and seen by the first polling
    /// cycle, which matters together with [`Self::start_block`].
    #[must_use]
    pub fn on(mut self, selector: EventSelector, callback: EventCallback) -> Self {
        self.subscriptions.push(Subscription::new(selector, callback));
        self
    }

    /// Replace every setting at once.
    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the interval between liveness probes.
    #[must_use]
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    /// Set how long a probe waits for its pong.
    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.pong_timeout = timeout;
        self
    }

    /// Set the number of consecutive failed attempts after which the connection terminates.
    ///
    /// The counter resets every time a socket opens. Default is
    /// [`DEFAULT_MAX_RECONNECT_ATTEMPTS`].
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Set the flat delay between a close and the next attempt.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the upper bound on opening a socket and on the client handshake.
    #[must_use]
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Set the interval between polling cycles.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the widest block range a single polling `getLogs` query may span.
    #[must_use]
    pub fn max_block_range(mut self, blocks: u64) -> Self {
        self.config.max_block_range = blocks;
        self
    }

    /// Set the maximum timeout for RPC operations.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the maximum number of retry attempts of calls made through the provider.
    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Set the base delay for exponential backoff retries.
    #[must_use]
    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.config.min_delay = min_delay;
        self
    }

    /// Require the node to report `chain_id`; a mismatch fails the attempt.
    #[must_use]
    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = Some(chain_id);
        self
    }

    /// Start the polling fallback after `block` instead of at the head seen by the first cycle.
    #[must_use]
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = Some(block);
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn settings(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connect and return the provider once the first client is ready.
    ///
    /// The controller keeps running in the background after this returns, reconnecting on every
    /// close until it runs out of attempts or the provider is shut down.
    ///
    /// # Errors
    ///
    /// * [`ConnectionError::InvalidConfig`] if a setting is out of range.
    /// * [`ConnectionError::RetriesExhausted`] if no client became ready within the attempt
    ///   ceiling.
    pub async fn connect(self) -> Result<ResilientProvider<F::Client>, ConnectionError> {
        self.config.validate()?;

        debug!(
            endpoint = self.endpoint.as_str(),
            max_reconnect_attempts = self.config.max_reconnect_attempts,
            reconnect_delay_ms = self.config.reconnect_delay.as_millis(),
            probe_interval_ms = self.config.probe_interval.as_millis(),
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "Connecting ResilientProvider"
        );

        let endpoint: Arc<str> = self.endpoint.into();
        let registry = SubscriptionRegistry::new();
        for subscription in self.subscriptions {
            registry.add(subscription.selector, subscription.callback).await;
        }
        let watermark = Watermark::new(self.config.start_block);
        let shutdown = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (client_tx, client_rx) = watch::channel(None);

        let provider = ResilientProvider::new(
            endpoint.clone(),
            registry.clone(),
            watermark.clone(),
            state_rx,
            client_rx,
            shutdown.clone(),
            &self.config,
        );

        let controller = ReconnectionController::new(
            endpoint,
            self.config,
            self.transport,
            self.factory,
            registry,
            watermark,
            state_tx,
            client_tx,
            shutdown,
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(controller.run(ready_tx));

        // dropping `provider` on the error path stops the controller
        ready_rx.await.map_err(|_| ConnectionError::Shutdown)??;
        Ok(provider)
    }
}

/// Connect every builder concurrently and keep the providers that came up.
///
/// Failed connections are logged and left out; the result preserves the input order of the
/// remaining ones.
pub async fn connect_all<T, F, I>(builders: I) -> Vec<ResilientProvider<F::Client>>
where
    T: Transport,
    F: ClientFactory<T::Socket>,
    I: IntoIterator<Item = ResilientProviderBuilder<T, F>>,
{
    let attempts = builders.into_iter().map(|builder| async move {
        let endpoint = builder.endpoint.clone();
        (endpoint, builder.connect().await)
    });

    join_all(attempts)
        .await
        .into_iter()
        .filter_map(|(endpoint, result)| match result {
            Ok(provider) => Some(provider),
            Err(e) => {
                error!(endpoint = endpoint.as_str(), error = %e, "Dropping unreachable endpoint");
                None
            }
        })
        .collect()
}
