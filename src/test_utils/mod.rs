//! In-memory transport, node, and assertion helpers for exercising the connection core.
//!
//! Available in this crate's tests and, for downstream crates, behind the `test-utils` feature.

pub mod macros;
mod mock;

pub use macros::EventRecorder;
pub use mock::{MockChain, MockClient, MockClientFactory, MockSocket, MockTransport, log_at};
