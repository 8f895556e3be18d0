// ============================================================================
// Session State Management
// ============================================================================
//
// State Pattern for the routing session. Routing reads nothing but the
// current state and the kind of the operation being dispatched.
//
// ```text
//         begin            flush start
//  Idle ─────────> Active ─────────────> Flushing
//   ^                │  <──────────────     │
//   │                │     flush end        │
//   └── commit/rollback ────────────────────┘
//
//  any ──close──> Closed
// ```
//
// ============================================================================

use crate::connection::EngineRole;
use crate::core::{DbError, Result};
use crate::session::OperationKind;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transaction; no connection held.
    Idle,

    /// Transaction begun; operations may be pending.
    Active,

    /// Pending operations are being sent to the writer.
    Flushing,

    /// Terminal. Every further operation fails.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Begin,
    FlushStart,
    FlushEnd,
    /// Commit or rollback finished.
    Finish,
    Close,
}

impl SessionState {
    pub fn transition(self, event: SessionEvent) -> Result<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Idle, Begin) => Ok(Active),
            (Active, FlushStart) => Ok(Flushing),
            (Flushing, FlushEnd) => Ok(Active),
            (Idle | Active | Flushing, Finish) => Ok(Idle),
            (_, Close) => Ok(Closed),
            (state, event) => Err(DbError::InvalidTransition(format!(
                "{:?} is not allowed while {}",
                event, state
            ))),
        }
    }

    pub fn is_flushing(&self) -> bool {
        matches!(self, SessionState::Flushing)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Flushing => write!(f, "FLUSHING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Pick the pool for an operation: the writer while flushing or for any
/// write, the reader otherwise.
pub fn route(state: SessionState, kind: OperationKind) -> EngineRole {
    if state.is_flushing() || kind.is_write() {
        EngineRole::Writer
    } else {
        EngineRole::Reader
    }
}
