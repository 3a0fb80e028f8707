//! HTTP request types.

use std::collections::HashMap;
use std::fmt;

/// HTTP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpVersion {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1 (default)
    #[default]
    Http11,
}

impl HttpVersion {
    /// Parse HTTP version from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    /// Returns true if this is HTTP/1.1.
    #[must_use]
    pub fn is_http11(self) -> bool {
        matches!(self, Self::Http11)
    }

    /// Returns the version string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP request verb.
///
/// Verbs outside the supported set parse as [`Verb::Other`] rather than
/// failing the request line; whether an `Other` request is serviceable is
/// the dispatcher's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// GET method.
    Get,
    /// POST method.
    Post,
    /// PUT method.
    Put,
    /// DELETE method.
    Delete,
    /// HEAD method.
    Head,
    /// OPTIONS method.
    Options,
    /// Any verb not in the supported set.
    Other,
}

impl Verb {
    /// Parse a verb from its request-line bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            b"GET" => Self::Get,
            b"POST" => Self::Post,
            b"PUT" => Self::Put,
            b"DELETE" => Self::Delete,
            b"HEAD" => Self::Head,
            b"OPTIONS" => Self::Options,
            _ => Self::Other,
        }
    }

    /// Returns the verb as its wire string.
    ///
    /// `Other` has no canonical spelling; it renders as `OTHER`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive header map.
///
/// Names are folded to lowercase on insertion; duplicate names are
/// last-wins. Values are stored with surrounding whitespace already
/// trimmed by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    map: HashMap<String, String>,
}

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value for the same name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.map.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Look up a header by name (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Returns true if the header is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterate over `(name, value)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no headers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A parsed HTTP request.
///
/// The URI is kept as the exact bytes from the request line;
/// [`path()`](Request::path) and [`query()`](Request::query) are views
/// into it. The body length always equals the declared `Content-Length`
/// once the parser reports the request complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    verb: Verb,
    uri: String,
    version: HttpVersion,
    headers: Headers,
    content_length: usize,
    body: Vec<u8>,
}

impl Request {
    /// Create a request with no headers or body.
    #[must_use]
    pub fn new(verb: Verb, uri: impl Into<String>, version: HttpVersion) -> Self {
        Self {
            verb,
            uri: uri.into(),
            version,
            headers: Headers::new(),
            content_length: 0,
            body: Vec::new(),
        }
    }

    /// The request verb.
    #[must_use]
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// The exact request URI from the request line.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The path component of the URI (query string stripped).
    #[must_use]
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(pos) => &self.uri[..pos],
            None => &self.uri,
        }
    }

    /// The query string (without the leading `?`), if present.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.uri.find('?').map(|pos| &self.uri[pos + 1..])
    }

    /// The HTTP version.
    #[must_use]
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// The headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The declared `Content-Length` (0 when the header is absent).
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Record the declared `Content-Length`.
    pub fn set_content_length(&mut self, len: usize) {
        self.content_length = len;
    }

    /// The request body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Whether the connection should stay open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is
    /// present; HTTP/1.0 requires an explicit `Connection: keep-alive`.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        if let Some(value) = self.headers.get("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    return false;
                }
                if token.eq_ignore_ascii_case("keep-alive") {
                    return true;
                }
            }
        }
        self.version.is_http11()
    }

    /// Whether this request asks to upgrade to the WebSocket protocol.
    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        match self.headers.get("upgrade") {
            Some(value) => value
                .split(',')
                .any(|v| v.trim().eq_ignore_ascii_case("websocket")),
            None => false,
        }
    }

    /// Serialize back to wire form.
    ///
    /// Header order is unspecified (the header map is unordered); parsing
    /// the result yields a request equal to `self`.
    #[must_use]
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.verb.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() && !self.headers.contains("content-length") {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_parsing() {
        assert_eq!(Verb::from_bytes(b"GET"), Verb::Get);
        assert_eq!(Verb::from_bytes(b"DELETE"), Verb::Delete);
        assert_eq!(Verb::from_bytes(b"PATCH"), Verb::Other);
        assert_eq!(Verb::from_bytes(b"get"), Verb::Other);
        assert_eq!(Verb::from_bytes(b""), Verb::Other);
    }

    #[test]
    fn headers_case_insensitive_last_wins() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");
        headers.insert("CONTENT-TYPE", "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn path_and_query_split() {
        let req = Request::new(Verb::Get, "/items/1?q=test&x=2", HttpVersion::Http11);
        assert_eq!(req.path(), "/items/1");
        assert_eq!(req.query(), Some("q=test&x=2"));
        assert_eq!(req.uri(), "/items/1?q=test&x=2");

        let bare = Request::new(Verb::Get, "/plain", HttpVersion::Http11);
        assert_eq!(bare.path(), "/plain");
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn keep_alive_defaults() {
        let mut req = Request::new(Verb::Get, "/", HttpVersion::Http11);
        assert!(req.keep_alive());
        req.headers_mut().insert("Connection", "close");
        assert!(!req.keep_alive());

        let mut old = Request::new(Verb::Get, "/", HttpVersion::Http10);
        assert!(!old.keep_alive());
        old.headers_mut().insert("Connection", "keep-alive");
        assert!(old.keep_alive());
    }

    #[test]
    fn keep_alive_token_list() {
        let mut req = Request::new(Verb::Get, "/", HttpVersion::Http11);
        req.headers_mut().insert("Connection", "keep-alive, Upgrade");
        assert!(req.keep_alive());
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut req = Request::new(Verb::Get, "/ws", HttpVersion::Http11);
        assert!(!req.is_websocket_upgrade());
        req.headers_mut().insert("Upgrade", "WebSocket");
        assert!(req.is_websocket_upgrade());
    }
}
