use std::{mem::discriminant, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::error::Elapsed;
use tokio_tungstenite::tungstenite;

/// Errors emitted by the connection core.
///
/// Transient failures (socket errors, client construction failures, readiness timeouts) are
/// handled internally by the reconnection controller and only surface through logs. Callers see
/// them when an RPC call made through [`ResilientProvider`](crate::ResilientProvider) fails, or as
/// [`ConnectionError::RetriesExhausted`] once the controller gives up.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// The WebSocket transport failed.
    #[error("WebSocket error: {0}")]
    WebSocket(Arc<tungstenite::Error>),

    /// The node answered a JSON-RPC request with an error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A frame or result could not be decoded.
    #[error("Malformed payload: {0}")]
    Decode(Arc<serde_json::Error>),

    /// A timeout elapsed while waiting for a response.
    #[error("Operation timed out")]
    Timeout,

    /// The socket carrying the request closed before a response arrived.
    #[error("Socket closed")]
    Closed,

    /// No socket is currently open (the controller is between attempts).
    #[error("Not connected")]
    NotConnected,

    /// The socket opened but the client did not report readiness in time.
    #[error("Client not ready after {0:?}")]
    NotReady(Duration),

    /// The node reported a different chain id than the one configured.
    #[error("Chain id mismatch: expected {expected}, node reported {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    /// The selector is neither `block` nor a `0x`-prefixed address.
    #[error("Invalid event selector: {0}")]
    InvalidSelector(String),

    /// A builder setting is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The reconnection ceiling was reached; the connection is terminated.
    #[error("Connection terminated after {attempts} failed attempts")]
    RetriesExhausted { attempts: usize },

    /// The connection was shut down by the caller.
    #[error("Connection shut down")]
    Shutdown,
}

impl ConnectionError {
    /// Returns `true` if retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::WebSocket(_) |
                ConnectionError::Timeout |
                ConnectionError::Closed |
                ConnectionError::NotConnected |
                ConnectionError::NotReady(_)
        )
    }
}

impl From<Elapsed> for ConnectionError {
    fn from(_: Elapsed) -> Self {
        ConnectionError::Timeout
    }
}

impl From<tungstenite::Error> for ConnectionError {
    fn from(error: tungstenite::Error) -> Self {
        ConnectionError::WebSocket(Arc::new(error))
    }
}

impl From<serde_json::Error> for ConnectionError {
    fn from(error: serde_json::Error) -> Self {
        ConnectionError::Decode(Arc::new(error))
    }
}

impl PartialEq for ConnectionError {
    fn eq(&self, other: &Self) -> bool {
        discriminant(self) == discriminant(other)
    }
}
