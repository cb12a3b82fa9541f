use std::fmt;

use url::Url;

use super::headers::HeaderMap;

/// HTTP request methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Loop the request back
    TRACE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Method names are case-sensitive, so `"get"` is not `GET`.
    ///
    /// ```
    /// # use sluice::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed request line and headers. Immutable once handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub method: Method,
    /// The request target exactly as sent.
    pub target: String,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
}

impl HttpRequestHead {
    pub fn new(method: Method, target: impl Into<String>, version: Version, headers: HeaderMap) -> Self {
        let target = target.into();
        let (path, query, fragment) = split_target(&target);
        Self {
            method,
            target,
            path,
            query,
            fragment,
            version,
            headers,
        }
    }

    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Whether the connection may carry another request after this one.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present;
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Whether the client waits for `100 Continue` before sending its body.
    pub fn expects_continue(&self) -> bool {
        expects_continue(self.version, &self.headers)
    }
}

pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    match version {
        Version::Http11 => !headers.has_token("Connection", "close"),
        Version::Http10 => headers.has_token("Connection", "keep-alive"),
    }
}

pub(crate) fn expects_continue(version: Version, headers: &HeaderMap) -> bool {
    version == Version::Http11
        && headers
            .get("Expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

/// Splits a request target into path, query and fragment.
fn split_target(target: &str) -> (String, Option<String>, Option<String>) {
    if target.starts_with("http://") || target.starts_with("https://") {
        if let Ok(url) = Url::parse(target) {
            return (
                url.path().to_string(),
                url.query().map(str::to_string),
                url.fragment().map(str::to_string),
            );
        }
    }

    let (rest, fragment) = match target.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment.to_string())),
        None => (target, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (rest, None),
    };
    (path.to_string(), query, fragment)
}
