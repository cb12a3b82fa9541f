//! Socket lifecycle state machine.
//!
//! ```text
//!   NotConnected ──connect──► Connecting ──ok──► Connected
//!        ▲                        │
//!        └────────── fail ────────┘
//! ```
//!
//! Orthogonal flags track each direction. The write side is shut down only
//! once it has ended and the output buffer is empty; the socket closes once,
//! when both directions have ended and nothing is left to send.

use crate::error::UsageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPhase {
    NotConnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketFlags {
    pub read_ended: bool,
    pub write_ended: bool,
    pub buffer_non_empty: bool,
    pub closed: bool,
    pub disposed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketState {
    phase: SocketPhase,
    flags: SocketFlags,
    shutdown_sent: bool,
}

impl SocketState {
    /// State of a socket that has not connected yet.
    pub fn new() -> Self {
        Self {
            phase: SocketPhase::NotConnected,
            flags: SocketFlags::default(),
            shutdown_sent: false,
        }
    }

    /// State of a socket handed over by an accept.
    pub fn accepted() -> Self {
        Self {
            phase: SocketPhase::Connected,
            ..Self::new()
        }
    }

    pub fn phase(&self) -> SocketPhase {
        self.phase
    }

    pub fn flags(&self) -> SocketFlags {
        self.flags
    }

    fn check_live(&self) -> Result<(), UsageError> {
        if self.flags.disposed {
            Err(UsageError::SocketDisposed)
        } else if self.flags.closed {
            Err(UsageError::SocketClosed)
        } else {
            Ok(())
        }
    }

    pub fn begin_connect(&mut self) -> Result<(), UsageError> {
        self.check_live()?;
        if self.phase != SocketPhase::NotConnected {
            return Err(UsageError::AlreadyConnected);
        }
        self.phase = SocketPhase::Connecting;
        Ok(())
    }

    /// Returns `false` when no connect was in flight.
    pub fn connect_succeeded(&mut self) -> bool {
        if self.phase != SocketPhase::Connecting || self.flags.closed {
            return false;
        }
        self.phase = SocketPhase::Connected;
        true
    }

    pub fn connect_failed(&mut self) {
        if self.phase == SocketPhase::Connecting {
            self.phase = SocketPhase::NotConnected;
        }
    }

    pub fn check_write(&self) -> Result<(), UsageError> {
        self.check_live()?;
        if self.flags.write_ended {
            return Err(UsageError::WriteAfterEnd);
        }
        if self.phase != SocketPhase::Connected {
            return Err(UsageError::NotConnected);
        }
        Ok(())
    }

    pub fn set_buffer_non_empty(&mut self, non_empty: bool) {
        self.flags.buffer_non_empty = non_empty;
    }

    pub fn end_write(&mut self) -> Result<(), UsageError> {
        self.check_live()?;
        if self.flags.write_ended {
            return Err(UsageError::AlreadyEnded);
        }
        if self.phase != SocketPhase::Connected {
            return Err(UsageError::NotConnected);
        }
        self.flags.write_ended = true;
        Ok(())
    }

    pub fn end_read(&mut self) {
        self.flags.read_ended = true;
    }

    /// Whether the OS-level half-close is due now.
    pub fn should_shutdown(&self) -> bool {
        self.flags.write_ended
            && !self.flags.buffer_non_empty
            && !self.shutdown_sent
            && !self.flags.closed
    }

    pub fn mark_shutdown(&mut self) {
        self.shutdown_sent = true;
    }

    pub fn should_close(&self) -> bool {
        self.flags.read_ended
            && self.flags.write_ended
            && !self.flags.buffer_non_empty
            && !self.flags.closed
    }

    /// Returns `true` only for the call that actually closed the socket.
    pub fn mark_closed(&mut self) -> bool {
        if self.flags.closed {
            return false;
        }
        self.flags.closed = true;
        true
    }

    pub fn dispose(&mut self) {
        self.flags.closed = true;
        self.flags.disposed = true;
    }

    pub fn can_receive(&self) -> bool {
        self.phase == SocketPhase::Connected
            && !self.flags.read_ended
            && !self.flags.closed
            && !self.flags.disposed
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed
    }

    pub fn is_disposed(&self) -> bool {
        self.flags.disposed
    }
}

impl Default for SocketState {
    fn default() -> Self {
        Self::new()
    }
}
