use std::{fmt, sync::Arc, time::Duration};

use alloy::rpc::types::Log;
use backon::{ExponentialBuilder, Retryable};
use tokio::{sync::watch, time::timeout};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    ConnectionError,
    connection::{ConnectionConfig, SubscriptionRegistry, Watermark},
    event_source::EventSource,
    types::{ConnectionState, EventCallback, EventSelector, LogQuery, Subscription},
};

/// Handle to a self-healing connection.
///
/// Subscriptions registered with [`ResilientProvider::on`] survive reconnections: every new client
/// gets them replayed. Queries go to whichever client is current, with retry and timeout.
///
/// Clones share the same connection. The background controller stops when
/// [`ResilientProvider::shutdown`] is called or the last clone is dropped.
pub struct ResilientProvider<C> {
    endpoint: Arc<str>,
    registry: SubscriptionRegistry,
    watermark: Watermark,
    state: watch::Receiver<ConnectionState>,
    client: watch::Receiver<Option<Arc<C>>>,
    shutdown: CancellationToken,
    _stop_on_drop: Arc<DropGuard>,
    call_timeout: Duration,
    max_retries: usize,
    min_delay: Duration,
}

impl<C> Clone for ResilientProvider<C> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            registry: self.registry.clone(),
            watermark: self.watermark.clone(),
            state: self.state.clone(),
            client: self.client.clone(),
            shutdown: self.shutdown.clone(),
            _stop_on_drop: self._stop_on_drop.clone(),
            call_timeout: self.call_timeout,
            max_retries: self.max_retries,
            min_delay: self.min_delay,
        }
    }
}

impl<C> fmt::Debug for ResilientProvider<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientProvider")
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state.borrow())
            .field("last_processed_block", &self.watermark.get())
            .finish_non_exhaustive()
    }
}

impl<C: EventSource> ResilientProvider<C> {
    pub(crate) fn new(
        endpoint: Arc<str>,
        registry: SubscriptionRegistry,
        watermark: Watermark,
        state: watch::Receiver<ConnectionState>,
        client: watch::Receiver<Option<Arc<C>>>,
        shutdown: CancellationToken,
        config: &ConnectionConfig,
    ) -> Self {
        Self {
            endpoint,
            registry,
            watermark,
            state,
            client,
            _stop_on_drop: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
            call_timeout: config.call_timeout,
            max_retries: config.max_retries,
            min_delay: config.min_delay,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stream of state changes, starting with the current state.
    #[must_use]
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state.clone())
    }

    /// Waits until the connection reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] if the connection terminates first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ConnectionError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|current| *current == target || current.is_terminated())
            .await
            .map(|current| *current)
            .unwrap_or(ConnectionState::Terminated);
        if reached == target { Ok(()) } else { Err(ConnectionError::NotConnected) }
    }

    /// The client of the currently open socket, if a client is ready.
    #[must_use]
    pub fn client(&self) -> Option<Arc<C>> {
        self.client.borrow().clone()
    }

    /// Highest block whose logs the polling fallback has fully delivered.
    #[must_use]
    pub fn last_processed_block(&self) -> Option<u64> {
        self.watermark.get()
    }

    /// Stream of watermark changes, starting with the current value.
    #[must_use]
    pub fn watermark_stream(&self) -> WatchStream<Option<u64>> {
        WatchStream::new(self.watermark.subscribe())
    }

    /// Selectors of every registered subscription, in registration order.
    pub async fn subscriptions(&self) -> Vec<EventSelector> {
        self.registry.selectors().await
    }

    /// Registers `callback` for `selector` and forwards it to the current client.
    ///
    /// The pair is replayed onto every future client. Registering the identical pair twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the client's error if it rejected the subscription for a reason a reconnect would
    /// not fix; the pair is unregistered in that case. Transient failures are left to the next
    /// replay.
    pub async fn on(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> Result<(), ConnectionError> {
        let (added, client) = self
            .registry
            .add_then(Subscription::new(selector, callback.clone()), || self.client())
            .await;
        if !added {
            debug!(selector = %selector, "Subscription already registered");
            return Ok(());
        }

        let Some(client) = client else {
            debug!(selector = %selector, "Not connected, subscription deferred to the next replay");
            return Ok(());
        };

        match client.on(selector, callback.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                warn!(
                    selector = %selector,
                    error = %e,
                    "Subscription deferred to the next replay"
                );
                Ok(())
            }
            Err(e) => {
                self.registry.remove(&selector, &callback).await;
                Err(e)
            }
        }
    }

    /// Unregisters the exact `(selector, callback)` pair. Returns `false` if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns the client's error if it failed to drop the live subscription for a non-transient
    /// reason. The pair is unregistered regardless.
    pub async fn off(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> Result<bool, ConnectionError> {
        if !self.registry.remove(&selector, &callback).await {
            return Ok(false);
        }
        if let Some(client) = self.client() {
            match client.off(selector, callback).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    debug!(selector = %selector, error = %e, "Live subscription already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Fetch the latest block number with retry and timeout.
    ///
    /// # Errors
    ///
    /// See [retry errors](#retry-errors).
    pub async fn get_block_number(&self) -> Result<u64, ConnectionError> {
        self.call(|client| async move { client.get_block_number().await }).await
    }

    /// Fetch logs matching `query` with retry and timeout.
    ///
    /// # Errors
    ///
    /// See [retry errors](#retry-errors).
    pub async fn get_logs(&self, query: LogQuery) -> Result<Vec<Log>, ConnectionError> {
        self.call(|client| async move { client.get_logs(query).await }).await
    }

    /// Stops the controller and closes the socket. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(endpoint = %self.endpoint, "Shutdown requested");
        }
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    /// Runs `operation` against the current client with retry and timeout.
    ///
    /// Wraps the retry logic with `tokio::time::timeout(self.call_timeout, ...)`. The client is
    /// looked up again before every attempt, so a retry can land on a client that came up after
    /// a reconnect.
    ///
    /// <a name="retry-errors"></a>
    /// # Errors
    ///
    /// * [`ConnectionError::NotConnected`] if no client is ready after all retries.
    /// * [`ConnectionError::Timeout`] if the overall call timeout elapses.
    /// * The last client error otherwise. Only transient errors are retried.
    pub(crate) async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ConnectionError>
    where
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        let retry_strategy = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.min_delay);

        timeout(
            self.call_timeout,
            (|| async {
                let client = self.client().ok_or(ConnectionError::NotConnected)?;
                operation(client).await
            })
            .retry(retry_strategy)
            .when(ConnectionError::is_transient)
            .notify(|err: &ConnectionError, dur: Duration| {
                info!(error = %err, "RPC error retrying after {:?}", dur);
            })
            .sleep(tokio::time::sleep),
        )
        .await?
    }
}
