//! Turns the parser's synchronous callbacks into an ordered event queue.
//!
//! Callbacks never act directly. Each received chunk is parsed to completion
//! first, collecting [`ParserEvent`]s; the caller then drains them in order
//! as one [`Commit`]. Only a `RequestBody` that is the last event of its
//! commit may apply backpressure, so pausing the socket can never strand an
//! already parsed event behind it.

use std::collections::VecDeque;
use std::net::IpAddr;

use bytes::Bytes;

use super::headers::HeaderMap;
use super::parser::{HeadInfo, ParserHandler, RequestParser};
use super::request::{HttpRequestHead, Method};
use crate::error::HttpError;

#[derive(Debug)]
pub enum ParserEvent {
    RequestHeaders { head: HttpRequestHead, info: HeadInfo },
    RequestBody(Bytes),
    RequestEnded,
}

/// One drained event and whether it may pause the socket.
#[derive(Debug)]
pub struct Committed {
    pub event: ParserEvent,
    pub may_pause: bool,
}

/// The events produced by one `execute`, in arrival order.
#[derive(Debug)]
pub struct Commit {
    events: VecDeque<ParserEvent>,
}

impl Commit {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Iterator for Commit {
    type Item = Committed;

    fn next(&mut self) -> Option<Committed> {
        let event = self.events.pop_front()?;
        let may_pause = self.events.is_empty() && matches!(event, ParserEvent::RequestBody(_));
        Some(Committed { event, may_pause })
    }
}

struct Collector {
    peer: Option<IpAddr>,
    method: Option<Method>,
    target: String,
    headers: HeaderMap,
    queue: VecDeque<ParserEvent>,
}

impl ParserHandler for Collector {
    fn on_message_begin(&mut self) {
        self.method = None;
        self.target.clear();
        self.headers = HeaderMap::new();
    }

    fn on_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    fn on_target(&mut self, target: &str) {
        self.target.push_str(target);
    }

    fn on_header(&mut self, name: &str, value: &str) {
        self.headers.append(name, value);
    }

    fn on_headers_complete(&mut self, info: &HeadInfo) {
        let mut headers = std::mem::take(&mut self.headers);
        if let Some(peer) = self.peer {
            headers.append_value("X-Forwarded-For", &peer.to_string());
        }
        let Some(method) = self.method.take() else {
            return;
        };
        let head = HttpRequestHead::new(method, std::mem::take(&mut self.target), info.version, headers);
        self.queue.push_back(ParserEvent::RequestHeaders {
            head,
            info: info.clone(),
        });
    }

    fn on_body(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.queue.push_back(ParserEvent::RequestBody(chunk));
        }
    }

    fn on_message_complete(&mut self) {
        self.queue.push_back(ParserEvent::RequestEnded);
    }
}

pub struct ParserAdapter {
    parser: RequestParser,
    collector: Collector,
}

impl ParserAdapter {
    /// `peer` is recorded in every request's `X-Forwarded-For`.
    pub fn new(peer: Option<IpAddr>) -> Self {
        Self {
            parser: RequestParser::new(),
            collector: Collector {
                peer,
                method: None,
                target: String::new(),
                headers: HeaderMap::new(),
                queue: VecDeque::new(),
            },
        }
    }

    /// Parses one received chunk and hands back everything it produced.
    ///
    /// Failing to consume the whole chunk is a protocol error; events parsed
    /// before the failure are discarded with it.
    pub fn execute(&mut self, data: &Bytes) -> Result<Commit, HttpError> {
        let result = self.parser.execute(&mut self.collector, data);
        let events = std::mem::take(&mut self.collector.queue);

        let consumed = result?;
        if consumed != data.len() {
            return Err(HttpError::Stalled {
                consumed,
                len: data.len(),
            });
        }
        Ok(Commit { events })
    }

    /// True when no request is partially received.
    pub fn is_idle(&self) -> bool {
        self.parser.is_idle()
    }
}
