//! Query lifecycle state machine
//!
//! ```text
//! Idle ──submit──▶ AwaitingUpstream ──first byte──▶ Streaming ──done──▶ Finalizing ──▶ Idle
//!                        │                              │
//!                        └──────────failure─────────────┴──▶ Aborted ──▶ Idle
//! ```
//!
//! A connection has at most one query outside `Idle` at a time; a submit in
//! any other state is rejected.

use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

/// State of a connection's current query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryState {
    /// No query in flight
    #[default]
    Idle,
    /// Query accepted, waiting for the agent
    AwaitingUpstream,
    /// Frames are being relayed
    Streaming,
    /// `done` received, writing results
    Finalizing,
    /// The query failed and is being reported
    Aborted,
}

impl QueryState {
    /// Whether `self → next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use QueryState::{Aborted, AwaitingUpstream, Finalizing, Idle, Streaming};
        matches!(
            (self, next),
            (Idle, AwaitingUpstream)
                | (AwaitingUpstream, Streaming | Aborted)
                | (Streaming, Finalizing | Aborted)
                | (Finalizing | Aborted, Idle)
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingUpstream => "awaiting_upstream",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Illegal state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal query transition {from} -> {to}")]
pub struct LifecycleError {
    /// State before
    pub from: QueryState,
    /// Requested state
    pub to: QueryState,
}

/// Shared, lock-protected [`QueryState`] of one connection
#[derive(Debug, Default)]
pub struct QueryLifecycle {
    state: Mutex<QueryState>,
}

impl QueryLifecycle {
    /// Start idle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> QueryState {
        *self.state.lock()
    }

    /// Atomically claim the connection for a new query
    ///
    /// Returns `false` if a query is already in flight.
    pub fn try_begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state != QueryState::Idle {
            return false;
        }
        *state = QueryState::AwaitingUpstream;
        true
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError` and leaves the state unchanged if the
    /// transition is not allowed.
    pub fn transition(&self, next: QueryState) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(LifecycleError {
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }

    /// Force the state back to `Idle`
    pub fn reset(&self) {
        *self.state.lock() = QueryState::Idle;
    }
}
