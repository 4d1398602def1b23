//! Processor lifecycle
//!
//! ```text
//! Created --start--> Started --stop--> Stopping --drained--> Stopped
//!    |                                                          |
//!    +----------------------dispose----------> Disposed <-------+
//! ```

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// Lifecycle state of an aggregating queue processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum State {
    /// Constructed, not started yet
    Created = 0,
    /// Accepting items, timer armed, workers running
    Started = 1,
    /// Draining; items are no longer accepted
    Stopping = 2,
    /// Drained, workers exited
    Stopped = 3,
    /// Resources released; no operation is valid anymore
    Disposed = 4,
}

impl State {
    /// Whether `self -> next` is a legal transition
    pub const fn can_transition_to(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::Created, State::Started)
                | (State::Started, State::Stopping)
                | (State::Stopping, State::Stopped)
                | (State::Created, State::Disposed)
                | (State::Stopped, State::Disposed)
        )
    }

    const fn from_u8(v: u8) -> State {
        match v {
            0 => State::Created,
            1 => State::Started,
            2 => State::Stopping,
            3 => State::Stopped,
            _ => State::Disposed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Created => write!(f, "created"),
            State::Started => write!(f, "started"),
            State::Stopping => write!(f, "stopping"),
            State::Stopped => write!(f, "stopped"),
            State::Disposed => write!(f, "disposed"),
        }
    }
}

/// State machine guarding every processor operation.
///
/// Data-plane calls hold a read guard for their whole duration, so a
/// transition never interleaves with an `add` that already passed its check.
/// The atomic mirror serves lock-free reads for observability.
pub(crate) struct Lifecycle {
    state: RwLock<State>,
    observed: AtomicU8,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(State::Created),
            observed: AtomicU8::new(State::Created as u8),
        }
    }

    /// Current state, without locking
    pub(crate) fn current(&self) -> State {
        State::from_u8(self.observed.load(Ordering::Acquire))
    }

    /// Hold the processor in `required` for the duration of an operation
    pub(crate) fn enter(
        &self,
        operation: &'static str,
        required: State,
    ) -> Result<RwLockReadGuard<'_, State>> {
        let guard = self.state.read();
        if *guard != required {
            return Err(Error::invalid_state(operation, *guard));
        }
        Ok(guard)
    }

    /// Move to `next`, failing with `InvalidState` if the move is not legal
    pub(crate) fn transition(&self, operation: &'static str, next: State) -> Result<State> {
        let mut state = self.state.write();
        let previous = *state;
        if !previous.can_transition_to(next) {
            return Err(Error::invalid_state(operation, previous));
        }
        *state = next;
        self.observed.store(next as u8, Ordering::Release);
        Ok(previous)
    }
}
