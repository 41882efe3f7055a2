//! Self-healing connection core.
//!
//! One [`ResilientProvider`] owns a background controller task that opens sockets, supervises
//! them with a keep-alive watchdog, replays the [`SubscriptionRegistry`] on every new client, and
//! runs a polling fallback that backfills logs the live stream may have dropped.
//!
//! Timers and tasks belonging to a socket are tagged with a [`GenerationGuard`]; tearing a socket
//! down bumps the generation so that a late tick from an old socket never touches a newer one.

mod builder;
mod controller;
mod poller;
mod provider;
mod range;
mod registry;
mod watchdog;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

pub use builder::{
    ConnectionConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_BLOCK_RANGE,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MAX_RETRIES, DEFAULT_MIN_DELAY, DEFAULT_POLL_INTERVAL,
    DEFAULT_PONG_TIMEOUT, DEFAULT_PROBE_INTERVAL, DEFAULT_READY_TIMEOUT, DEFAULT_RECONNECT_DELAY,
    ResilientProviderBuilder, connect_all,
};
pub use poller::Watermark;
pub use provider::ResilientProvider;
pub use registry::{ReplayReport, SubscriptionRegistry};

/// Monotonic counter identifying the socket currently owned by a controller.
#[derive(Debug, Clone, Default)]
pub(crate) struct Generation(Arc<AtomicU64>);

impl Generation {
    /// Invalidates every outstanding guard and returns a guard for the new generation.
    pub(crate) fn advance(&self) -> GenerationGuard {
        let id = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        GenerationGuard { generation: self.clone(), id }
    }

    /// Guard for the current generation.
    pub(crate) fn guard(&self) -> GenerationGuard {
        GenerationGuard { generation: self.clone(), id: self.0.load(Ordering::Acquire) }
    }
}

/// Proof that a task was started for a particular socket.
#[derive(Debug, Clone)]
pub(crate) struct GenerationGuard {
    generation: Generation,
    id: u64,
}

impl GenerationGuard {
    pub(crate) fn is_current(&self) -> bool {
        self.generation.0.load(Ordering::Acquire) == self.id
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}
