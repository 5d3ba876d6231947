//! Per-connection lifecycle state machine.
//!
//! `Connecting -> Open -> {Closed, Errored}`, plus `Connecting -> Errored` for
//! an upgrade that never completes. Terminal states are final, so a connection
//! produces at most one terminal event.

use std::fmt;

use thiserror::Error;

use crate::ids::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored { reason: String },
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Errored { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Errored { .. } => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a connection ended. Exactly one is produced per opened connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Closed,
    Errored { reason: String },
}

impl Termination {
    pub fn errored(reason: impl Into<String>) -> Self {
        Self::Errored {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection {id}: cannot {action} while {state}")]
pub struct TransitionError {
    pub id: ConnectionId,
    pub state: String,
    pub action: &'static str,
}

#[derive(Debug)]
pub struct ConnectionLifecycle {
    id: ConnectionId,
    state: ConnectionState,
}

impl ConnectionLifecycle {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn open(&mut self) -> Result<(), TransitionError> {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Open;
                Ok(())
            }
            _ => Err(self.reject("open")),
        }
    }

    /// Moves to a terminal state. Closing is only valid from `Open`; an error
    /// may also end a connection that is still `Connecting`.
    pub fn terminate(&mut self, termination: Termination) -> Result<Termination, TransitionError> {
        let next = match (&self.state, &termination) {
            (ConnectionState::Open, Termination::Closed) => ConnectionState::Closed,
            (
                ConnectionState::Open | ConnectionState::Connecting,
                Termination::Errored { reason },
            ) => ConnectionState::Errored {
                reason: reason.clone(),
            },
            (_, Termination::Closed) => return Err(self.reject("close")),
            (_, Termination::Errored { .. }) => return Err(self.reject("error")),
        };
        self.state = next;
        Ok(termination)
    }

    fn reject(&self, action: &'static str) -> TransitionError {
        TransitionError {
            id: self.id,
            state: self.state.to_string(),
            action,
        }
    }
}
