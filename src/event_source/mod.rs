//! Event-source client abstraction.
//!
//! An [`EventSource`] is the node client the connection core drives: it answers block-number and
//! log queries, registers live subscriptions, and reports when its own handshake has finished.
//! A [`ClientFactory`] builds one over each freshly opened socket. [`JsonRpcClient`] speaks
//! Ethereum JSON-RPC over any [`Socket`].

mod json_rpc;

use std::sync::Arc;

use alloy::rpc::types::Log;
use tokio::sync::mpsc;

use crate::{
    ConnectionError,
    transport::Socket,
    types::{EventCallback, EventSelector, LogQuery},
};

pub use json_rpc::{JsonRpcClient, JsonRpcClientFactory};

/// Client of the remote event source, bound to one socket.
pub trait EventSource: Send + Sync + 'static {
    /// Returns `Ok(true)` once the client finished its handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake failed in a way waiting will not fix, for example a
    /// chain id mismatch.
    fn is_ready(&self) -> Result<bool, ConnectionError>;

    /// Latest block number known to the node.
    fn get_block_number(&self) -> impl Future<Output = Result<u64, ConnectionError>> + Send;

    /// Logs matching `query`, in the order the node returns them.
    fn get_logs(
        &self,
        query: LogQuery,
    ) -> impl Future<Output = Result<Vec<Log>, ConnectionError>> + Send;

    /// Registers a live subscription on this client.
    fn on(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Removes a live subscription previously registered with [`EventSource::on`].
    fn off(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Builds an [`EventSource`] over an opened socket.
pub trait ClientFactory<S: Socket>: Send + Sync + 'static {
    type Client: EventSource;

    /// Constructs the client. `inbound` carries the socket's text frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed over this socket.
    fn build(
        &self,
        socket: Arc<S>,
        inbound: mpsc::UnboundedReceiver<String>,
        chain_id: Option<u64>,
    ) -> Result<Self::Client, ConnectionError>;
}
