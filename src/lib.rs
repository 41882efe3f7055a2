//! Resilient-Provider keeps a WebSocket connection to an EVM node alive and its subscriptions
//! flowing.
//!
//! The main entry point is [`ResilientProvider`], built via [`ResilientProviderBuilder`] and
//! connected with [`ResilientProviderBuilder::connect`]. Register subscriptions with
//! [`ResilientProvider::on`]; they are replayed onto every client the provider creates.
//!
//! # Reconnection
//!
//! Every socket close schedules a new attempt after a flat delay. Attempts are counted until a
//! socket opens; after `max_reconnect_attempts` consecutive failures the connection reaches
//! [`ConnectionState::Terminated`] and stays there.
//!
//! # Keep-alive
//!
//! A half-open socket never closes on its own. The provider pings the node on a fixed interval and
//! terminates the socket when a pong does not arrive in time, which feeds the regular reconnection
//! path.
//!
//! # Polling fallback
//!
//! Live log subscriptions can silently drop events around a reconnect. On a fixed interval the
//! provider queries `eth_getLogs` for every address subscription over the blocks since the last
//! fully processed block, and delivers the results to the same callbacks. A log may therefore be
//! delivered more than once; consumers should deduplicate, for example by transaction hash and log
//! index.
//!
//! Block subscriptions are not backfilled: headers missed while disconnected are not replayed.
//!
//! # Pluggable transport
//!
//! [`WsTransport`] and [`JsonRpcClient`] are the default socket and client. Any [`Transport`] and
//! [`ClientFactory`] pair can be supplied via [`ResilientProviderBuilder::with_transport`].

#[macro_use]
mod logging;

pub mod connection;
pub mod event_source;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

mod error;
mod types;

pub use connection::{
    ConnectionConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_BLOCK_RANGE,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MAX_RETRIES, DEFAULT_MIN_DELAY, DEFAULT_POLL_INTERVAL,
    DEFAULT_PONG_TIMEOUT, DEFAULT_PROBE_INTERVAL, DEFAULT_READY_TIMEOUT, DEFAULT_RECONNECT_DELAY,
    ReplayReport, ResilientProvider, ResilientProviderBuilder, SubscriptionRegistry, Watermark,
    connect_all,
};
pub use error::ConnectionError;
pub use event_source::{ClientFactory, EventSource, JsonRpcClient, JsonRpcClientFactory};
pub use transport::{
    Connection, ReadyState, Socket, SocketEvent, Transport, WsSocket, WsTransport,
};
pub use types::{ConnectionState, Event, EventCallback, EventSelector, LogQuery, Subscription};
