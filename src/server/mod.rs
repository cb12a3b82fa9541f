//! Listening servers.
//!
//! The published lifecycle state sits behind a private lock because
//! `listen`, `close` and the connection counter are touched both from
//! application threads and from the dispatch thread. Everything else about a
//! server lives on the dispatch thread inside the reactor.

pub mod listener;
pub mod state;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::info;

use crate::error::UsageError;
use crate::net::{SocketDelegate, SocketId};
use crate::reactor::Reactor;
use crate::scheduler::SchedulerHandle;
use state::{CloseOutcome, ServerPhase, ServerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(u64);

impl ServerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Receives the connections a server accepts.
pub trait ConnectionDelegate: Send {
    /// Builds the event handler for a freshly accepted connection.
    fn on_connection(&mut self, id: SocketId, peer: SocketAddr) -> Box<dyn SocketDelegate>;

    /// The listener failed and is closing.
    fn on_error(&mut self, _error: &io::Error) {}

    /// Fires exactly once, after the listener closed and the last connection finished.
    fn on_closed(&mut self) {}
}

/// Shared lifecycle state of one server plus the listener's stop signal.
#[derive(Clone)]
pub struct ServerControl {
    id: ServerId,
    state: Arc<Mutex<ServerState>>,
    stop: Arc<Notify>,
}

impl ServerControl {
    pub fn new(id: ServerId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(ServerState::new())),
            stop: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn phase(&self) -> ServerPhase {
        self.lock().phase()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections()
    }

    pub fn listen(&self) -> Result<(), UsageError> {
        self.lock().listen()
    }

    pub fn connection_opened(&self) -> Result<(), UsageError> {
        self.lock().connection_opened()
    }

    pub fn connection_closed(&self) -> bool {
        self.lock().connection_closed()
    }

    /// Moves the state machine towards `Closed` and stops the accept loop.
    pub fn close(&self) -> Result<CloseOutcome, UsageError> {
        let outcome = self.lock().close()?;
        self.stop.notify_one();
        Ok(outcome)
    }

    pub fn dispose(&self) {
        self.lock().dispose();
        self.stop.notify_one();
    }

    /// Resolves once `close` or `dispose` has been called.
    pub async fn stopped(&self) {
        self.stop.notified().await
    }
}

impl fmt::Debug for ServerControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ServerControl")
            .field("id", &self.id)
            .field("phase", &state.phase())
            .field("connections", &state.connections())
            .finish()
    }
}

/// Returned by `listen`; closing it stops accepting new connections.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    control: ServerControl,
    local_addr: SocketAddr,
    scheduler: SchedulerHandle<Reactor>,
}

impl ServerHandle {
    pub(crate) fn new(control: ServerControl, local_addr: SocketAddr, scheduler: SchedulerHandle<Reactor>) -> Self {
        Self {
            control,
            local_addr,
            scheduler,
        }
    }

    pub fn id(&self) -> ServerId {
        self.control.id()
    }

    /// Address the listener is bound to, with the real port when 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn phase(&self) -> ServerPhase {
        self.control.phase()
    }

    /// Number of accepted connections not yet closed.
    pub fn connections(&self) -> usize {
        self.control.connections()
    }

    /// Stops accepting. Live connections keep running until they finish.
    ///
    /// # Returns
    ///
    /// `Closed` when no connection was open, `Closing` with the number still
    /// open otherwise, or a `UsageError` once the server has been disposed.
    pub fn close(&self) -> Result<CloseOutcome, UsageError> {
        let outcome = self.control.close()?;
        info!(server = %self.id(), addr = %self.local_addr, ?outcome, "closing listener");
        if outcome == CloseOutcome::Closed {
            let id = self.id();
            self.scheduler.post(move |reactor| {
                reactor.finish_server(id);
                Ok(())
            });
        }
        Ok(outcome)
    }

    /// Tears the server down without waiting for its connections.
    ///
    /// Open connections are closed right away.
    pub fn dispose(&self) {
        self.control.dispose();
        let id = self.id();
        self.scheduler.post(move |reactor| {
            reactor.dispose_server(id);
            Ok(())
        });
    }
}
