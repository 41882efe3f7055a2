use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval, timeout},
};

use crate::{
    ConnectionError,
    connection::{GenerationGuard, SubscriptionRegistry, range::RangeIterator},
    event_source::EventSource,
    types::{Event, LogQuery},
};

/// Highest block whose logs the polling fallback has fully delivered.
///
/// Shared across reconnections; it never moves backwards.
#[derive(Debug, Clone)]
pub struct Watermark {
    sender: Arc<watch::Sender<Option<u64>>>,
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Watermark {
    /// Creates a watermark. With `Some(block)`, the first poll backfills from `block + 1`.
    #[must_use]
    pub fn new(start: Option<u64>) -> Self {
        Self { sender: Arc::new(watch::Sender::new(start)) }
    }

    #[must_use]
    pub fn get(&self) -> Option<u64> {
        *self.sender.borrow()
    }

    /// Receiver notified every time the watermark advances.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.sender.subscribe()
    }

    /// Moves the watermark to `block` unless it is already there or beyond.
    pub(crate) fn advance(&self, block: u64) -> bool {
        self.sender.send_if_modified(|current| match current {
            Some(last) if *last >= block => false,
            _ => {
                *current = Some(block);
                true
            }
        })
    }
}

/// What a single polling cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// No watermark existed; the current head was recorded without querying logs.
    Baseline { block: u64 },
    /// The head has not moved past the watermark.
    Idle { block: u64 },
    /// Every query succeeded and the watermark moved to `to_block`.
    Advanced { from_block: u64, to_block: u64, delivered: usize },
    /// A query failed; the watermark stays at `block`, the end of the last fully processed batch,
    /// so the rest of the range is retried.
    Held { block: u64, delivered: usize, failed: usize },
}

/// Polling settings shared by every cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSettings {
    pub(crate) call_timeout: Duration,
    /// Widest block range a single `getLogs` query may span.
    pub(crate) max_block_range: u64,
}

/// Runs one polling cycle against `client`.
///
/// The range `(watermark, head]` is walked in batches of at most `max_block_range` blocks. Logs
/// for each address subscription are delivered to its callback in the order the node returns
/// them, and the watermark advances after every batch all subscriptions got through. Block
/// subscriptions are acknowledged without a query; headers are only delivered by the live stream.
///
/// # Errors
///
/// Returns an error if the head could not be read or the cycle was started for a socket that has
/// since been replaced. The watermark keeps the last fully processed batch in both cases.
pub(crate) async fn poll_once<C: EventSource>(
    client: &C,
    registry: &SubscriptionRegistry,
    watermark: &Watermark,
    settings: PollSettings,
    guard: &GenerationGuard,
) -> Result<PollOutcome, ConnectionError> {
    let head = timeout(settings.call_timeout, client.get_block_number()).await??;

    let Some(last) = watermark.get() else {
        if !guard.is_current() {
            return Err(ConnectionError::NotConnected);
        }
        watermark.advance(head);
        debug!(block = head, "Polling baseline recorded");
        return Ok(PollOutcome::Baseline { block: head });
    };

    if head <= last {
        return Ok(PollOutcome::Idle { block: last });
    }

    let subscriptions = registry.snapshot().await;
    let from_block = last + 1;
    let mut delivered = 0;

    for batch in RangeIterator::forward(from_block, head, settings.max_block_range) {
        let mut failed = 0;

        for subscription in &subscriptions {
            let Some(address) = subscription.selector.address() else {
                continue;
            };

            let query = LogQuery { address, from_block: *batch.start(), to_block: *batch.end() };
            let logs = match timeout(settings.call_timeout, client.get_logs(query)).await {
                Ok(Ok(logs)) => logs,
                Ok(Err(e)) => {
                    failed += 1;
                    error!(
                        address = %address,
                        from_block = query.from_block,
                        to_block = query.to_block,
                        error = %e,
                        "Log query failed"
                    );
                    continue;
                }
                Err(_) => {
                    failed += 1;
                    error!(
                        address = %address,
                        from_block = query.from_block,
                        to_block = query.to_block,
                        "Log query timed out"
                    );
                    continue;
                }
            };

            if !guard.is_current() {
                return Err(ConnectionError::NotConnected);
            }
            for log in logs {
                subscription.deliver(&Event::from(log));
                delivered += 1;
            }
        }

        if failed > 0 {
            let block = watermark.get().unwrap_or(last);
            warn!(block = block, failed = failed, "Holding watermark after failed log queries");
            return Ok(PollOutcome::Held { block, delivered, failed });
        }

        if !guard.is_current() {
            return Err(ConnectionError::NotConnected);
        }
        watermark.advance(*batch.end());
    }

    debug!(from_block = from_block, to_block = head, delivered = delivered, "Watermark advanced");
    Ok(PollOutcome::Advanced { from_block, to_block: head, delivered })
}

/// Periodic driver of [`poll_once`] for one client.
#[derive(Debug)]
pub(crate) struct EventPoller {
    poll_interval: Duration,
    settings: PollSettings,
    task: Option<JoinHandle<()>>,
}

impl EventPoller {
    pub(crate) fn new(poll_interval: Duration, settings: PollSettings) -> Self {
        Self { poll_interval, settings, task: None }
    }

    /// Starts polling through `client`. The first cycle runs immediately.
    pub(crate) fn start<C: EventSource>(
        &mut self,
        client: Arc<C>,
        registry: SubscriptionRegistry,
        watermark: Watermark,
        guard: GenerationGuard,
    ) {
        self.stop();
        let poll_interval = self.poll_interval;
        let settings = self.settings;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !guard.is_current() {
                    return;
                }
                match poll_once(client.as_ref(), &registry, &watermark, settings, &guard).await {
                    Ok(outcome) => trace!(outcome = ?outcome, "Polling cycle finished"),
                    Err(e) => warn!(error = %e, "Polling cycle aborted"),
                }
            }
        }));
    }

    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
