//! HTTP/1.1 on top of the socket layer.
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`parser`**: incremental request parser with callback output
//! - **`adapter`**: queues parser callbacks and commits them per received chunk
//! - **`connection`**: the socket delegate tying parsing, bodies and responses together
//! - **`transaction`**: the in-order response chain for pipelined requests
//! - **`writer`**: response framing and serialization
//! - **`request`** / **`response`** / **`headers`**: message types
//!
//! # Request flow
//!
//! ```text
//!   bytes ──► ParserAdapter ──► RequestHeaders ──► RequestDelegate::on_request
//!                    │                                    │
//!                    ├─► RequestBody ─► DataSubject ─► app consumer
//!                    │                                    │
//!                    └─► RequestEnded                 Responder
//!                                                         │
//!   socket ◄── SegmentChain (front segment only) ◄────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sluice::config::Config;
//! use sluice::http::response::Response;
//! use sluice::reactor::EventLoop;
//!
//! let event_loop = EventLoop::new(Config::default())?;
//! let server = event_loop.serve(|_head: HttpRequestHead, body: RequestBody, responder: Responder| {
//!     body.discard();
//!     responder.send(Response::ok("hello\n"));
//! })?;
//! ```

pub mod adapter;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod transaction;
pub mod writer;
