//! Error types
//!
//! Contract violations (`UsageError`) are kept apart from runtime failures so
//! that callers can tell a programming mistake from a dropped peer.

use std::io;

use thiserror::Error;

use crate::server::state::ServerPhase;

/// A call that is not valid in the current state of the object it targets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("write after the write side was ended")]
    WriteAfterEnd,
    #[error("write issued while the previous write is still waiting for drain")]
    WritePending,
    #[error("end called on a socket whose write side already ended")]
    AlreadyEnded,
    #[error("connect is only valid on a socket that was never connected")]
    AlreadyConnected,
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is closed")]
    SocketClosed,
    #[error("socket has been disposed")]
    SocketDisposed,
    #[error("server cannot {action} while {state}")]
    InvalidServerTransition {
        action: &'static str,
        state: ServerPhase,
    },
    #[error("consumer already connected")]
    ConsumerAlreadyConnected,
    #[error("data received after end of stream")]
    DataAfterEnd,
    #[error("a resume continuation is already pending")]
    ResumePending,
    #[error("response already written for this request")]
    ResponseAlreadyWritten,
}

/// Socket-level failure: either a contract violation or a transport error.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Malformed or unsupported HTTP/1.1 request syntax. Always fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("malformed request head: {0}")]
    Head(httparse::Error),
    #[error("unrecognised HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("header {0:?} has a value that is not valid UTF-8")]
    InvalidHeaderValue(String),
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,
    #[error("both Content-Length and Transfer-Encoding present")]
    AmbiguousBodyLength,
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("chunk data not followed by CRLF")]
    InvalidChunkTerminator,
    #[error("parser stopped after {consumed} of {len} bytes")]
    Stalled { consumed: usize, len: usize },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("dispatch thread panicked")]
    Panicked,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid listen address {0:?}")]
    ListenAddr(String),
}
