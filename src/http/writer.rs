use bytes::{BufMut, Bytes, BytesMut};

use super::request::{Method, Version};
use super::response::HttpResponseHead;
use super::transaction::RequestInfo;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Interim response sent ahead of the final one.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Terminates a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// How body bytes go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body is written at all.
    None,
    /// Bytes are written as they come; length is known or the close delimits it.
    Raw,
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePlan {
    pub framing: Framing,
    /// The connection ends after this response.
    pub close_after: bool,
}

/// Settles framing and connection headers for a response.
///
/// Adjusts `head` in place: adds `Content-Length: 0` or
/// `Transfer-Encoding: chunked` where the body needs it, and the
/// `Connection` header matching the decision to keep the connection.
pub fn prepare(head: &mut HttpResponseHead, request: &RequestInfo, has_body: bool, force_close: bool) -> ResponsePlan {
    let headers = &mut head.headers;
    let mut close_after = force_close || !request.keep_alive || headers.has_token("Connection", "close");

    let framing = if request.method == Method::HEAD || !head.status.allows_body() {
        Framing::None
    } else if !has_body {
        if !headers.contains("Content-Length") {
            headers.insert("Content-Length", "0");
        }
        Framing::None
    } else if headers.contains("Content-Length") {
        Framing::Raw
    } else if headers.has_token("Transfer-Encoding", "chunked") {
        Framing::Chunked
    } else if request.version == Version::Http11 {
        headers.insert("Transfer-Encoding", "chunked");
        Framing::Chunked
    } else {
        // HTTP/1.0 has no chunked coding; the close marks the end
        close_after = true;
        Framing::Raw
    };

    if close_after {
        headers.insert("Connection", "close");
    } else if request.version == Version::Http10 {
        headers.insert("Connection", "keep-alive");
    }

    ResponsePlan { framing, close_after }
}

/// Serializes the status line and headers.
pub fn render_head(head: &HttpResponseHead) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    // Status line
    buf.put_slice(HTTP_VERSION.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(head.status.as_u16().to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(head.status.reason_phrase().as_bytes());
    buf.put_slice(b"\r\n");

    // Headers
    for (k, v) in head.headers.iter() {
        buf.put_slice(k.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(v.as_bytes());
        buf.put_slice(b"\r\n");
    }

    // Header/body separator
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Wraps one body chunk in chunked framing.
pub fn frame_chunk(data: &[u8]) -> Bytes {
    let size = format!("{:X}\r\n", data.len());
    let mut buf = BytesMut::with_capacity(size.len() + data.len() + 2);
    buf.put_slice(size.as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}
