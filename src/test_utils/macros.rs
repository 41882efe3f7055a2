use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio_stream::{Stream, StreamExt};

use crate::{ConnectionState, Event, EventCallback};

/// Asserts the next state published on a [`ResilientProvider::state_stream`] stream.
///
/// Waits up to `timeout` seconds (default 5) for the next value; under a paused test clock the
/// wait is in virtual time.
///
/// [`ResilientProvider::state_stream`]: crate::ResilientProvider::state_stream
#[macro_export]
macro_rules! assert_next_state {
    ($stream: expr, $expected: expr) => {
        $crate::assert_next_state!($stream, $expected, timeout = 5)
    };
    ($stream: expr, $expected: expr, timeout = $secs: expr) => {
        let state = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out waiting for the next connection state");
        match state {
            std::option::Option::Some(state) => {
                assert_eq!(state, $expected, "Expected state {:?}, got {:?}", $expected, state);
            }
            std::option::Option::None => {
                panic!("Expected state {:?}, but the state stream ended", $expected);
            }
        }
    };
}

/// Asserts that a stream of states reaches `expected`, skipping intermediate states.
#[macro_export]
macro_rules! assert_reaches_state {
    ($stream: expr, $expected: expr) => {
        $crate::assert_reaches_state!($stream, $expected, timeout = 5)
    };
    ($stream: expr, $expected: expr, timeout = $secs: expr) => {
        $crate::test_utils::macros::assert_reaches_state(
            &mut $stream,
            $expected,
            std::time::Duration::from_secs($secs),
        )
        .await
    };
}

/// Asserts that an [`EventRecorder`] holds exactly `count` events once it stops growing.
///
/// Waits up to `timeout` seconds (default 5) for at least `count` events.
#[macro_export]
macro_rules! assert_recorded {
    ($recorder: expr, $count: expr) => {
        $crate::assert_recorded!($recorder, $count, timeout = 5)
    };
    ($recorder: expr, $count: expr, timeout = $secs: expr) => {
        $crate::test_utils::macros::wait_for_events(
            &$recorder,
            $count,
            std::time::Duration::from_secs($secs),
        )
        .await;
        assert_eq!(
            $recorder.len(),
            $count,
            "Expected {} events, recorded: {:#?}",
            $count,
            $recorder.block_numbers()
        );
    };
}

#[allow(clippy::missing_panics_doc)]
pub async fn assert_reaches_state<S: Stream<Item = ConnectionState> + Unpin>(
    stream: &mut S,
    expected: ConnectionState,
    timeout: Duration,
) {
    let mut seen = Vec::new();
    let outcome = tokio::time::timeout(timeout, async {
        while let Some(state) = stream.next().await {
            seen.push(state);
            if state == expected {
                return true;
            }
        }
        false
    })
    .await;

    match outcome {
        Ok(true) => {}
        Ok(false) => panic!("State stream ended before reaching {expected:?}, saw {seen:?}"),
        Err(_) => panic!("Timed out waiting for {expected:?}, saw {seen:?}"),
    }
}

#[allow(clippy::missing_panics_doc)]
pub async fn wait_for_events(recorder: &EventRecorder, count: usize, timeout: Duration) {
    let waited = tokio::time::timeout(timeout, async {
        while recorder.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        waited.is_ok(),
        "Timed out waiting for {count} events, recorded {}: {:#?}",
        recorder.len(),
        recorder.block_numbers()
    );
}

/// Collects every event delivered to its callback.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback appending to this recorder. Every call returns a distinct callback identity.
    #[must_use]
    pub fn callback(&self) -> EventCallback {
        let events = self.events.clone();
        Arc::new(move |event: &Event| events.lock().unwrap().push(event.clone()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Block numbers of the recorded events, in delivery order.
    #[must_use]
    pub fn block_numbers(&self) -> Vec<Option<u64>> {
        self.events.lock().unwrap().iter().map(Event::block_number).collect()
    }
}
