use std::{fmt, str::FromStr, sync::Arc};

use alloy::{
    primitives::Address,
    rpc::types::{Filter, Header, Log},
};

use crate::ConnectionError;

/// What a subscription listens for.
///
/// The connection core only distinguishes block headers from address-filtered logs; anything
/// finer (topics, event signatures) is the callback's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSelector {
    /// New block headers (`newHeads`).
    Block,
    /// Logs emitted by a contract address.
    Address(Address),
}

impl EventSelector {
    /// Returns the address for log selectors.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        match self {
            EventSelector::Block => None,
            EventSelector::Address(address) => Some(*address),
        }
    }
}

impl From<Address> for EventSelector {
    fn from(address: Address) -> Self {
        EventSelector::Address(address)
    }
}

impl FromStr for EventSelector {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "block" {
            return Ok(EventSelector::Block);
        }
        if !s.starts_with("0x") {
            return Err(ConnectionError::InvalidSelector(s.to_owned()));
        }
        s.parse::<Address>()
            .map(EventSelector::Address)
            .map_err(|_| ConnectionError::InvalidSelector(s.to_owned()))
    }
}

impl fmt::Display for EventSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSelector::Block => f.write_str("block"),
            EventSelector::Address(address) => write!(f, "{address}"),
        }
    }
}

/// A delivered event.
#[derive(Debug, Clone)]
pub enum Event {
    Block(Box<Header>),
    Log(Box<Log>),
}

impl Event {
    /// Block number carried by the event, when the node supplied one.
    #[must_use]
    pub fn block_number(&self) -> Option<u64> {
        match self {
            Event::Block(header) => Some(header.number),
            Event::Log(log) => log.block_number,
        }
    }
}

impl From<Log> for Event {
    fn from(log: Log) -> Self {
        Event::Log(Box::new(log))
    }
}

impl From<Header> for Event {
    fn from(header: Header) -> Self {
        Event::Block(Box::new(header))
    }
}

/// Callback invoked for every delivered event.
///
/// Delivery is at-least-once: the polling fallback may hand over a log the live stream already
/// delivered.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// A registered `(selector, callback)` pair.
#[derive(Clone)]
pub struct Subscription {
    pub selector: EventSelector,
    pub callback: EventCallback,
}

impl Subscription {
    #[must_use]
    pub fn new(selector: EventSelector, callback: EventCallback) -> Self {
        Self { selector, callback }
    }

    /// Identity is the pair: same selector and the very same callback allocation.
    #[must_use]
    pub fn is(&self, selector: &EventSelector, callback: &EventCallback) -> bool {
        self.selector == *selector && Arc::ptr_eq(&self.callback, callback)
    }

    pub(crate) fn deliver(&self, event: &Event) {
        (self.callback)(event);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("selector", &self.selector).finish_non_exhaustive()
    }
}

/// Arguments of a `getLogs` query. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub from_block: u64,
    pub to_block: u64,
}

impl From<&LogQuery> for Filter {
    fn from(query: &LogQuery) -> Self {
        Filter::new().address(query.address).from_block(query.from_block).to_block(query.to_block)
    }
}

/// Lifecycle of a single connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A socket is being opened or the client is completing its handshake.
    Connecting,
    /// The socket is open.
    Open,
    /// The socket closed; a retry is pending.
    Closed,
    /// Retries are exhausted or shutdown was requested. Terminal.
    Terminated,
}

impl ConnectionState {
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, ConnectionState::Terminated)
    }
}
