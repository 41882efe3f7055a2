//! Socket abstraction the connection core drives.
//!
//! A [`Transport`] opens sockets; each opened socket comes with two unbounded channels: lifecycle
//! [`SocketEvent`]s consumed by the reconnection controller, and inbound text frames consumed by
//! the event-source client built over the socket. [`WsTransport`] is the WebSocket implementation.

mod ws;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ConnectionError;

pub use ws::{WsSocket, WsTransport};

/// Socket ready-state, mirroring the WebSocket `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            ReadyState::Connecting => 0,
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Lifecycle notifications emitted by an open socket.
///
/// A socket emits at most one [`SocketEvent::Close`]; an [`SocketEvent::Error`] is expected to be
/// followed by a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Pong,
    Error(String),
    Close { code: Option<u16>, reason: String },
}

/// Handle to one open socket.
pub trait Socket: Send + Sync + 'static {
    fn ready_state(&self) -> ReadyState;

    /// Queues a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the socket is no longer open.
    fn send(&self, text: String) -> Result<(), ConnectionError>;

    /// Sends a liveness probe. The matching pong arrives as [`SocketEvent::Pong`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the socket is no longer open.
    fn ping(&self) -> Result<(), ConnectionError>;

    /// Forcibly closes the socket, emitting a single [`SocketEvent::Close`].
    ///
    /// Calling this on an already closed socket does nothing.
    fn terminate(&self);
}

/// An opened socket together with its event and frame channels.
pub struct Connection<S> {
    pub socket: Arc<S>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens sockets to an endpoint.
pub trait Transport: Send + Sync + 'static {
    type Socket: Socket;

    /// Opens a new socket. Resolving successfully is the socket-open notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be reached or the handshake fails.
    fn open(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Connection<Self::Socket>, ConnectionError>> + Send;
}
