//! Connection-level networking: output buffering, the socket state machine
//! and the transport seam between the socket and the operating system.

pub mod buffer;
pub mod socket;
pub mod state;
pub mod testing;
pub mod transport;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use buffer::OutputBuffer;
pub use socket::{Socket, SocketCx, SocketDelegate, SocketEvent, WriteStatus};
pub use state::{SocketFlags, SocketPhase, SocketState};
pub use transport::{Completion, CompletionSink, IoStatus, TcpTransport, Transport, TransportOptions};

/// Identifies one socket for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lets the reactor hand a typed delegate back to the code that installed it.
pub trait AsAny: Any {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
