//! Sluice - event-driven TCP server and HTTP/1.1 core
//!
//! All protocol state lives on one dispatch thread fed by a task
//! [`Scheduler`](scheduler::Scheduler); socket I/O runs on a tokio runtime
//! and reports back as tasks. The [`EventLoop`](reactor::EventLoop) wires
//! the two together.

pub mod config;
pub mod data;
pub mod error;
pub mod http;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod server;

pub use config::Config;
pub use error::{HttpError, SocketError, UsageError};
pub use reactor::{EventLoop, Reactor};
