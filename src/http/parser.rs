//! Streaming HTTP/1.1 request parser.
//!
//! Bytes are fed in whatever pieces the socket delivers. The request head is
//! buffered until complete and tokenised with `httparse`; body framing
//! (Content-Length or chunked) is decoded here, handing out zero-copy slices
//! of the input. Results are reported synchronously through
//! [`ParserHandler`] callbacks, in wire order.

use bytes::{Bytes, BytesMut};

use super::headers::HeaderMap;
use super::request::{Method, Version, expects_continue, keep_alive};
use crate::error::HttpError;

/// Largest request head accepted, request line included.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
pub const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
}

/// Facts about a request that are settled once its head is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub version: Version,
    pub keep_alive: bool,
    pub expects_continue: bool,
    pub body: BodyLength,
}

pub trait ParserHandler {
    fn on_message_begin(&mut self) {}
    fn on_method(&mut self, method: Method);
    fn on_target(&mut self, target: &str);
    fn on_header(&mut self, name: &str, value: &str);
    fn on_headers_complete(&mut self, info: &HeadInfo);
    fn on_body(&mut self, chunk: Bytes);
    fn on_message_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
}

struct ParsedHead {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    len: usize,
}

#[derive(Debug)]
pub struct RequestParser {
    state: State,
    head: BytesMut,
    line: BytesMut,
    error: Option<HttpError>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::Head,
            head: BytesMut::new(),
            line: BytesMut::new(),
            error: None,
        }
    }

    /// True between messages with nothing partially read.
    pub fn is_idle(&self) -> bool {
        self.state == State::Head && self.head.is_empty()
    }

    /// Parses as much of `data` as possible and returns how many bytes were
    /// consumed. A parser that failed once keeps failing.
    pub fn execute(&mut self, handler: &mut dyn ParserHandler, data: &Bytes) -> Result<usize, HttpError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        self.run(handler, data).inspect_err(|e| self.error = Some(e.clone()))
    }

    fn run(&mut self, handler: &mut dyn ParserHandler, data: &Bytes) -> Result<usize, HttpError> {
        let mut pos = 0;
        while pos < data.len() {
            pos += match self.state {
                State::Head => self.read_head(handler, &data[pos..])?,
                State::Fixed { remaining } => {
                    let n = take(remaining, data.len() - pos);
                    handler.on_body(data.slice(pos..pos + n));
                    if remaining == n as u64 {
                        self.finish(handler);
                    } else {
                        self.state = State::Fixed {
                            remaining: remaining - n as u64,
                        };
                    }
                    n
                }
                State::ChunkSize => self.read_chunk_size(&data[pos..])?,
                State::ChunkData { remaining } => {
                    let n = take(remaining, data.len() - pos);
                    handler.on_body(data.slice(pos..pos + n));
                    self.state = if remaining == n as u64 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData {
                            remaining: remaining - n as u64,
                        }
                    };
                    n
                }
                State::ChunkDataEnd => self.read_chunk_end(&data[pos..])?,
                State::Trailers => self.read_trailers(handler, &data[pos..])?,
            };
        }
        Ok(pos)
    }

    fn finish(&mut self, handler: &mut dyn ParserHandler) {
        self.state = State::Head;
        handler.on_message_complete();
    }

    fn read_head(&mut self, handler: &mut dyn ParserHandler, input: &[u8]) -> Result<usize, HttpError> {
        let mut skipped = 0;
        if self.head.is_empty() {
            // empty lines between pipelined requests are tolerated
            skipped = input.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
            if skipped == input.len() {
                return Ok(skipped);
            }
        }

        let previous = self.head.len();
        self.head.extend_from_slice(&input[skipped..]);

        match parse_head(&self.head)? {
            None if self.head.len() > MAX_HEAD_SIZE => Err(HttpError::HeadTooLarge(MAX_HEAD_SIZE)),
            None => Ok(input.len()),
            Some(head) if head.len > MAX_HEAD_SIZE => Err(HttpError::HeadTooLarge(MAX_HEAD_SIZE)),
            Some(head) => {
                let used = head.len - previous;
                self.head.clear();
                self.begin_message(handler, head)?;
                Ok(skipped + used)
            }
        }
    }

    fn begin_message(&mut self, handler: &mut dyn ParserHandler, head: ParsedHead) -> Result<(), HttpError> {
        let body = body_length(&head.headers)?;
        let info = HeadInfo {
            version: head.version,
            keep_alive: keep_alive(head.version, &head.headers),
            expects_continue: expects_continue(head.version, &head.headers),
            body,
        };

        handler.on_message_begin();
        handler.on_method(head.method);
        handler.on_target(&head.target);
        for (name, value) in head.headers.iter() {
            handler.on_header(name, value);
        }
        handler.on_headers_complete(&info);

        match body {
            BodyLength::Empty | BodyLength::Fixed(0) => self.finish(handler),
            BodyLength::Fixed(n) => self.state = State::Fixed { remaining: n },
            BodyLength::Chunked => self.state = State::ChunkSize,
        }
        Ok(())
    }

    fn read_chunk_size(&mut self, input: &[u8]) -> Result<usize, HttpError> {
        let (line, used) = take_line(&mut self.line, input, MAX_CHUNK_LINE, HttpError::InvalidChunkSize)?;
        let Some(line) = line else {
            return Ok(used);
        };

        let text = std::str::from_utf8(&line).map_err(|_| HttpError::InvalidChunkSize)?;
        let size = text.split(';').next().unwrap_or("").trim();
        if size.is_empty() {
            return Err(HttpError::InvalidChunkSize);
        }
        let size = u64::from_str_radix(size, 16).map_err(|_| HttpError::InvalidChunkSize)?;

        self.state = if size == 0 {
            State::Trailers
        } else {
            State::ChunkData { remaining: size }
        };
        Ok(used)
    }

    fn read_chunk_end(&mut self, input: &[u8]) -> Result<usize, HttpError> {
        let (line, used) = take_line(&mut self.line, input, 2, HttpError::InvalidChunkTerminator)?;
        match line {
            Some(line) if !line.is_empty() => Err(HttpError::InvalidChunkTerminator),
            Some(_) => {
                self.state = State::ChunkSize;
                Ok(used)
            }
            None => Ok(used),
        }
    }

    fn read_trailers(&mut self, handler: &mut dyn ParserHandler, input: &[u8]) -> Result<usize, HttpError> {
        let (line, used) = take_line(&mut self.line, input, MAX_HEAD_SIZE, HttpError::HeadTooLarge(MAX_HEAD_SIZE))?;
        // trailer fields are read and dropped
        if line.is_some_and(|l| l.is_empty()) {
            self.finish(handler);
        }
        Ok(used)
    }
}

fn take(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

/// Accumulates one line into `buf`. Returns the line without its terminator
/// once complete, and how much of `input` was used.
fn take_line(
    buf: &mut BytesMut,
    input: &[u8],
    limit: usize,
    too_long: HttpError,
) -> Result<(Option<BytesMut>, usize), HttpError> {
    match input.iter().position(|&b| b == b'\n') {
        Some(i) => {
            buf.extend_from_slice(&input[..i]);
            if buf.last() == Some(&b'\r') {
                buf.truncate(buf.len() - 1);
            }
            if buf.len() > limit {
                return Err(too_long);
            }
            Ok((Some(buf.split()), i + 1))
        }
        None => {
            buf.extend_from_slice(input);
            if buf.len() > limit {
                return Err(too_long);
            }
            Ok((None, input.len()))
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<ParsedHead>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf).map_err(HttpError::Head)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let method_str = req.method.unwrap_or_default();
    let method = Method::from_str(method_str).ok_or_else(|| HttpError::InvalidMethod(method_str.to_string()))?;
    let version = match req.version {
        Some(0) => Version::Http10,
        _ => Version::Http11,
    };

    let mut fields = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let value =
            std::str::from_utf8(header.value).map_err(|_| HttpError::InvalidHeaderValue(header.name.to_string()))?;
        fields.append(header.name, value.trim());
    }

    Ok(Some(ParsedHead {
        method,
        target: req.path.unwrap_or("/").to_string(),
        version,
        headers: fields,
        len,
    }))
}

fn body_length(headers: &HeaderMap) -> Result<BodyLength, HttpError> {
    if headers.contains("Transfer-Encoding") {
        if headers.contains("Content-Length") {
            return Err(HttpError::AmbiguousBodyLength);
        }
        let last = headers
            .get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .last();
        return match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => Ok(BodyLength::Chunked),
            _ => Err(HttpError::UnsupportedTransferEncoding),
        };
    }

    let mut length = None;
    for part in headers.get_all("Content-Length").flat_map(|v| v.split(',')) {
        let part = part.trim();
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HttpError::InvalidContentLength);
        }
        let n: u64 = part.parse().map_err(|_| HttpError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != n => return Err(HttpError::InvalidContentLength),
            _ => length = Some(n),
        }
    }

    Ok(match length {
        Some(n) => BodyLength::Fixed(n),
        None => BodyLength::Empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace(Vec<String>);

    impl ParserHandler for Trace {
        fn on_method(&mut self, method: Method) {
            self.0.push(format!("method {method}"));
        }
        fn on_target(&mut self, target: &str) {
            self.0.push(format!("target {target}"));
        }
        fn on_header(&mut self, name: &str, value: &str) {
            self.0.push(format!("header {name}={value}"));
        }
        fn on_headers_complete(&mut self, info: &HeadInfo) {
            self.0.push(format!("head {:?}", info.body));
        }
        fn on_body(&mut self, chunk: Bytes) {
            self.0.push(format!("body {}", String::from_utf8_lossy(&chunk)));
        }
        fn on_message_complete(&mut self) {
            self.0.push("complete".to_string());
        }
    }

    #[test]
    fn parse_simple_get() {
        let req = Bytes::from_static(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let mut parser = RequestParser::new();
        let mut trace = Trace::default();

        let consumed = parser.execute(&mut trace, &req).unwrap();

        assert_eq!(consumed, req.len());
        assert_eq!(
            trace.0,
            vec!["method GET", "target /", "header Host=example.com", "head Empty", "complete"]
        );
        assert!(parser.is_idle());
    }

    #[test]
    fn chunk_size_split_across_reads() {
        let mut parser = RequestParser::new();
        let mut trace = Trace::default();
        for piece in [
            "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            "1",
            "0\r\n0123456789abcdef\r",
            "\n0\r\n\r\n",
        ] {
            parser.execute(&mut trace, &Bytes::from(piece)).unwrap();
        }
        assert_eq!(
            &trace.0[3..],
            ["head Chunked", "body 0123456789abcdef", "complete"]
        );
    }
}
