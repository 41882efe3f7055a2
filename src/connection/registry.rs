use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{
    event_source::EventSource,
    types::{EventCallback, EventSelector, Subscription},
};

/// Result of replaying the registry onto a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
}

/// Every `(selector, callback)` pair registered through a connection, in registration order.
///
/// The registry outlives individual clients: each new client gets the full list replayed onto it.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<RwLock<Vec<Subscription>>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pair. Returns `false` if the identical pair is already registered.
    pub async fn add(&self, selector: EventSelector, callback: EventCallback) -> bool {
        self.add_then(Subscription::new(selector, callback), || ()).await.0
    }

    /// Appends `subscription` and runs `then` before the write lock is released.
    ///
    /// A replay cannot interleave between the two, so whatever client `then` observes either
    /// receives the pair from the caller or from the next replay.
    pub(crate) async fn add_then<R>(
        &self,
        subscription: Subscription,
        then: impl FnOnce() -> R,
    ) -> (bool, R) {
        let mut entries = self.entries.write().await;
        let added =
            !entries.iter().any(|sub| sub.is(&subscription.selector, &subscription.callback));
        if added {
            entries.push(subscription);
        }
        (added, then())
    }

    /// Removes the exact pair. Other callbacks on the same selector are kept.
    pub async fn remove(&self, selector: &EventSelector, callback: &EventCallback) -> bool {
        let mut entries = self.entries.write().await;
        match entries.iter().position(|sub| sub.is(selector, callback)) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Copy of the current entries.
    pub async fn snapshot(&self) -> Vec<Subscription> {
        self.entries.read().await.clone()
    }

    pub async fn selectors(&self) -> Vec<EventSelector> {
        self.entries.read().await.iter().map(|sub| sub.selector).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Issues one `on` per entry against `client`. A failing entry does not stop the others.
    pub async fn replay<C: EventSource>(&self, client: &C) -> ReplayReport {
        self.replay_then(client, || ()).await.0
    }

    /// Replays onto `client` and runs `then` while still holding the read lock.
    pub(crate) async fn replay_then<C: EventSource, R>(
        &self,
        client: &C,
        then: impl FnOnce() -> R,
    ) -> (ReplayReport, R) {
        let entries = self.entries.read().await;
        let mut report = ReplayReport::default();
        for subscription in entries.iter() {
            match client.on(subscription.selector, subscription.callback.clone()).await {
                Ok(()) => report.replayed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        selector = %subscription.selector,
                        error = %e,
                        "Failed to replay subscription"
                    );
                }
            }
        }
        let published = then();
        (report, published)
    }
}
