//! Incremental HTTP/1.1 request parser.
//!
//! Feed bytes as they arrive via [`feed`][RequestParser::feed]; the
//! parser buffers internally and reports [`ParseStatus::Complete`] once a
//! full request (headers plus declared body) is available. Arbitrary
//! chunking is fine, down to one byte at a time.
//!
//! Line terminators may be CRLF or bare LF. Header names are
//! case-insensitive and duplicate names are last-wins, with one
//! exception: a repeated `Content-Length` is rejected outright.

use quay_core::{HttpVersion, Request, Verb};

/// HTTP parsing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is not `VERB SP URI SP VERSION`.
    InvalidRequestLine,
    /// A header line is malformed.
    InvalidHeader,
    /// `Content-Length` is not a non-negative decimal.
    InvalidContentLength,
    /// More than one `Content-Length` header.
    DuplicateContentLength,
    /// The request exceeds the configured byte limit.
    TooLarge,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content-length"),
            Self::DuplicateContentLength => write!(f, "duplicate content-length"),
            Self::TooLarge => write!(f, "request too large"),
        }
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    /// Whether this error should answer 413 rather than 400.
    #[must_use]
    pub fn is_too_large(&self) -> bool {
        matches!(self, Self::TooLarge)
    }
}

/// Result of an incremental parse attempt.
#[derive(Debug)]
pub enum ParseStatus {
    /// A full request is available.
    Complete(Request),
    /// More data is required.
    Incomplete,
}

/// Default cap on the bytes of a single request (request line + headers +
/// body), a few MiB per the usual embedded-server sizing.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug)]
enum ParseState {
    RequestLine,
    Headers {
        request: Request,
        content_length: Option<usize>,
    },
    Body {
        request: Request,
        remaining: usize,
    },
}

/// Incremental request parser.
pub struct RequestParser {
    max_request_bytes: usize,
    buffer: Vec<u8>,
    state: ParseState,
}

impl RequestParser {
    /// Create a parser with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_request_bytes(DEFAULT_MAX_REQUEST_BYTES)
    }

    /// Create a parser with an explicit size limit.
    #[must_use]
    pub fn with_max_request_bytes(limit: usize) -> Self {
        Self {
            max_request_bytes: limit,
            buffer: Vec::new(),
            state: ParseState::RequestLine,
        }
    }

    /// Bytes currently buffered but not yet consumed.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Take any unconsumed bytes out of the parser.
    ///
    /// Used on protocol upgrade: bytes that followed the upgrade request
    /// belong to the next protocol's decoder.
    #[must_use]
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.state = ParseState::RequestLine;
        std::mem::take(&mut self.buffer)
    }

    /// Discard buffered data and reset to the initial state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::RequestLine;
    }

    /// Feed new bytes and attempt to complete a request.
    ///
    /// After a `Complete`, feed an empty slice to continue parsing any
    /// pipelined bytes already buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<ParseStatus, ParseError> {
        if !bytes.is_empty() {
            self.buffer.extend_from_slice(bytes);
        }
        if self.buffer.len() > self.max_request_bytes {
            return Err(ParseError::TooLarge);
        }

        loop {
            match std::mem::replace(&mut self.state, ParseState::RequestLine) {
                ParseState::RequestLine => {
                    let Some((line, consumed)) = take_line(&self.buffer) else {
                        return Ok(ParseStatus::Incomplete);
                    };
                    if line.is_empty() {
                        // Tolerate a stray blank line between requests.
                        self.buffer.drain(..consumed);
                        continue;
                    }
                    let request = parse_request_line(line)?;
                    self.buffer.drain(..consumed);
                    self.state = ParseState::Headers {
                        request,
                        content_length: None,
                    };
                }
                ParseState::Headers {
                    mut request,
                    mut content_length,
                } => {
                    let Some((line, consumed)) = take_line(&self.buffer) else {
                        self.state = ParseState::Headers {
                            request,
                            content_length,
                        };
                        return Ok(ParseStatus::Incomplete);
                    };
                    if line.is_empty() {
                        // End of headers.
                        self.buffer.drain(..consumed);
                        let declared = content_length.unwrap_or(0);
                        request.set_content_length(declared);
                        if declared == 0 {
                            return Ok(ParseStatus::Complete(request));
                        }
                        if declared > self.max_request_bytes {
                            return Err(ParseError::TooLarge);
                        }
                        self.state = ParseState::Body {
                            request,
                            remaining: declared,
                        };
                        continue;
                    }
                    let line = line.to_vec();
                    self.buffer.drain(..consumed);
                    parse_header_line(&line, &mut request, &mut content_length)?;
                    self.state = ParseState::Headers {
                        request,
                        content_length,
                    };
                }
                ParseState::Body {
                    mut request,
                    remaining,
                } => {
                    if self.buffer.len() < remaining {
                        self.state = ParseState::Body { request, remaining };
                        return Ok(ParseStatus::Incomplete);
                    }
                    let body: Vec<u8> = self.buffer.drain(..remaining).collect();
                    request.set_body(body);
                    return Ok(ParseStatus::Complete(request));
                }
            }
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find one line in `buffer`.
///
/// Returns the line contents (terminator stripped, trailing CR removed)
/// and the number of bytes to consume. `None` when no full line is
/// buffered yet.
fn take_line(buffer: &[u8]) -> Option<(&[u8], usize)> {
    let newline = buffer.iter().position(|&b| b == b'\n')?;
    let mut line = &buffer[..newline];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((line, newline + 1))
}

fn parse_request_line(line: &[u8]) -> Result<Request, ParseError> {
    if line.iter().any(|&b| b == 0) {
        return Err(ParseError::InvalidRequestLine);
    }
    let mut parts = line.splitn(3, |&b| b == b' ');
    let verb_bytes = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let uri_bytes = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version_bytes = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    if verb_bytes.is_empty() || uri_bytes.is_empty() {
        return Err(ParseError::InvalidRequestLine);
    }

    let verb = Verb::from_bytes(verb_bytes);
    let uri = std::str::from_utf8(uri_bytes)
        .map_err(|_| ParseError::InvalidRequestLine)?
        .to_string();
    let version_str =
        std::str::from_utf8(version_bytes).map_err(|_| ParseError::InvalidRequestLine)?;
    let version = HttpVersion::parse(version_str.trim()).ok_or(ParseError::InvalidRequestLine)?;

    Ok(Request::new(verb, uri, version))
}

fn parse_header_line(
    line: &[u8],
    request: &mut Request,
    content_length: &mut Option<usize>,
) -> Result<(), ParseError> {
    // Continuation lines (obs-fold) are obsolete and rejected.
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ParseError::InvalidHeader);
    }
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let name_bytes = &line[..colon];
    if name_bytes.is_empty() || !name_bytes.iter().all(|&b| is_token_char(b)) {
        return Err(ParseError::InvalidHeader);
    }
    let value_bytes = &line[colon + 1..];
    if value_bytes
        .iter()
        .any(|&b| b == 0 || b == 0x7f || (b < 0x20 && b != b'\t'))
    {
        return Err(ParseError::InvalidHeader);
    }

    let name = std::str::from_utf8(name_bytes).map_err(|_| ParseError::InvalidHeader)?;
    let value = std::str::from_utf8(value_bytes)
        .map_err(|_| ParseError::InvalidHeader)?
        .trim();

    if name.eq_ignore_ascii_case("content-length") {
        if content_length.is_some() {
            return Err(ParseError::DuplicateContentLength);
        }
        let parsed: usize = value
            .parse()
            .map_err(|_| ParseError::InvalidContentLength)?;
        *content_length = Some(parsed);
    }

    request.headers_mut().insert(name, value);
    Ok(())
}

fn is_token_char(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`'
            | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(bytes: &[u8]) -> Result<ParseStatus, ParseError> {
        RequestParser::new().feed(bytes)
    }

    fn complete(status: ParseStatus) -> Request {
        match status {
            ParseStatus::Complete(request) => request,
            ParseStatus::Incomplete => panic!("expected a complete request"),
        }
    }

    #[test]
    fn simple_get() {
        let req = complete(
            parse_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap(),
        );
        assert_eq!(req.verb(), Verb::Get);
        assert_eq!(req.uri(), "/index.html");
        assert_eq!(req.version(), HttpVersion::Http11);
        assert_eq!(req.headers().get("host"), Some("example.com"));
        assert_eq!(req.content_length(), 0);
        assert!(req.body().is_empty());
    }

    #[test]
    fn bare_lf_line_endings() {
        let req = complete(parse_all(b"GET / HTTP/1.1\nHost: x\n\n").unwrap());
        assert_eq!(req.headers().get("host"), Some("x"));
    }

    #[test]
    fn one_byte_at_a_time() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello";
        let mut parser = RequestParser::new();
        for (i, byte) in raw.iter().enumerate() {
            match parser.feed(std::slice::from_ref(byte)).unwrap() {
                ParseStatus::Complete(request) => {
                    assert_eq!(i, raw.len() - 1, "completed early at byte {i}");
                    assert_eq!(request.body(), b"hello");
                    assert_eq!(request.content_length(), 5);
                    return;
                }
                ParseStatus::Incomplete => {}
            }
        }
        panic!("request never completed");
    }

    #[test]
    fn unknown_verb_is_other() {
        let req = complete(parse_all(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap());
        assert_eq!(req.verb(), Verb::Other);
    }

    #[test]
    fn header_values_are_trimmed_and_last_wins() {
        let req = complete(
            parse_all(b"GET / HTTP/1.1\r\nX-A:   spaced value  \r\nx-a: second\r\n\r\n").unwrap(),
        );
        assert_eq!(req.headers().get("X-A"), Some("second"));
    }

    #[test]
    fn duplicate_content_length_rejected() {
        let err = parse_all(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 3\r\n\r\nabc")
            .unwrap_err();
        assert_eq!(err, ParseError::DuplicateContentLength);
    }

    #[test]
    fn negative_content_length_rejected() {
        let err = parse_all(b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidContentLength);
    }

    #[test]
    fn missing_version_rejected() {
        assert_eq!(
            parse_all(b"GET /\r\n\r\n").unwrap_err(),
            ParseError::InvalidRequestLine
        );
    }

    #[test]
    fn garbage_header_rejected() {
        assert_eq!(
            parse_all(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").unwrap_err(),
            ParseError::InvalidHeader
        );
    }

    #[test]
    fn body_exactly_at_limit_accepted() {
        let mut parser = RequestParser::with_max_request_bytes(4096);
        let body = vec![b'x'; 1000];
        let mut raw = b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);
        let req = complete(parser.feed(&raw).unwrap());
        assert_eq!(req.body().len(), 1000);
    }

    #[test]
    fn declared_body_over_limit_rejected() {
        let mut parser = RequestParser::with_max_request_bytes(4096);
        let err = parser
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 5000\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParseError::TooLarge);
        assert!(err.is_too_large());
    }

    #[test]
    fn buffered_overflow_rejected() {
        let mut parser = RequestParser::with_max_request_bytes(64);
        let long_uri = vec![b'a'; 200];
        let mut raw = b"GET /".to_vec();
        raw.extend_from_slice(&long_uri);
        assert_eq!(parser.feed(&raw).unwrap_err(), ParseError::TooLarge);
    }

    #[test]
    fn pipelined_requests_parse_in_turn() {
        let mut parser = RequestParser::new();
        let raw = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let first = complete(parser.feed(raw).unwrap());
        assert_eq!(first.uri(), "/a");
        let second = complete(parser.feed(&[]).unwrap());
        assert_eq!(second.uri(), "/b");
        assert!(matches!(
            parser.feed(&[]).unwrap(),
            ParseStatus::Incomplete
        ));
    }

    #[test]
    fn take_buffered_returns_trailing_bytes() {
        let mut parser = RequestParser::new();
        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n\x81\x85extra";
        let req = complete(parser.feed(raw).unwrap());
        assert!(req.is_websocket_upgrade());
        assert_eq!(parser.take_buffered(), b"\x81\x85extra");
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let mut original = Request::new(Verb::Post, "/submit?x=1", HttpVersion::Http11);
        original.headers_mut().insert("host", "example.com");
        original.headers_mut().insert("content-length", "3");
        original.set_content_length(3);
        original.set_body(b"abc".to_vec());

        let parsed = complete(parse_all(&original.to_wire_bytes()).unwrap());
        assert_eq!(parsed, original);
    }
}
