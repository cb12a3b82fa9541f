//! Server lifecycle state machine.
//!
//! ```text
//!   Unstarted ──listen──► Listening ──close──► Closing ──last conn──► Closed
//!       │                     └───────close (no conns)──────────────►  ▲
//!       └──────────────────────close─────────────────────────────────┘
//!   any ──dispose──► Disposed
//! ```

use std::fmt;

use crate::error::UsageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Unstarted,
    Listening,
    Closing,
    Closed,
    Disposed,
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::Listening => write!(f, "listening"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// What a `close` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The server is closed now; the caller fires the closed notification.
    Closed,
    /// Connections remain; the last one to finish closes the server.
    Closing { remaining: usize },
    AlreadyClosing,
    AlreadyClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    phase: ServerPhase,
    connections: usize,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            phase: ServerPhase::Unstarted,
            connections: 0,
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    pub fn connections(&self) -> usize {
        self.connections
    }

    fn invalid(&self, action: &'static str) -> UsageError {
        UsageError::InvalidServerTransition {
            action,
            state: self.phase,
        }
    }

    pub fn listen(&mut self) -> Result<(), UsageError> {
        if self.phase != ServerPhase::Unstarted {
            return Err(self.invalid("listen"));
        }
        self.phase = ServerPhase::Listening;
        Ok(())
    }

    /// Counts an accepted connection. Only valid while listening.
    pub fn connection_opened(&mut self) -> Result<(), UsageError> {
        if self.phase != ServerPhase::Listening {
            return Err(self.invalid("accept"));
        }
        self.connections += 1;
        Ok(())
    }

    /// Returns `true` when this was the connection that let `Closing` become `Closed`.
    pub fn connection_closed(&mut self) -> bool {
        self.connections = self.connections.saturating_sub(1);
        if self.phase == ServerPhase::Closing && self.connections == 0 {
            self.phase = ServerPhase::Closed;
            return true;
        }
        false
    }

    pub fn close(&mut self) -> Result<CloseOutcome, UsageError> {
        match self.phase {
            ServerPhase::Unstarted => {
                self.phase = ServerPhase::Closed;
                Ok(CloseOutcome::Closed)
            }
            ServerPhase::Listening if self.connections == 0 => {
                self.phase = ServerPhase::Closed;
                Ok(CloseOutcome::Closed)
            }
            ServerPhase::Listening => {
                self.phase = ServerPhase::Closing;
                Ok(CloseOutcome::Closing {
                    remaining: self.connections,
                })
            }
            ServerPhase::Closing => Ok(CloseOutcome::AlreadyClosing),
            ServerPhase::Closed => Ok(CloseOutcome::AlreadyClosed),
            ServerPhase::Disposed => Err(self.invalid("close")),
        }
    }

    pub fn dispose(&mut self) {
        self.phase = ServerPhase::Disposed;
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}
