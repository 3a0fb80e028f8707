//! Per-connection protocol state machine.
//!
//! A connection moves through request parsing, dispatch, response
//! streaming and (optionally) a WebSocket session, driven entirely by
//! readable/writable events from the reactor. All socket I/O is
//! non-blocking: reads loop until would-block or EOF, writes loop until
//! would-block and leave the unsent suffix in the output buffer.
//!
//! The reactor owns the write-interest invariant: after every drive it
//! subscribes for writable readiness exactly when the output buffer is
//! non-empty.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use quay_core::{
    Access, Credentials, Request, Response, Session, SessionId, SsoAuthenticator, StaticResolver,
    StatusCode, Verb, WebSocketHandler, http_date,
};
use quay_http::{
    FrameDecoder, Opcode, ParseError, ParseStatus, RequestParser, WsEvent, encode_close,
    encode_frame, encode_message, encode_pong, upgrade_response,
};

use crate::poller::Interest;
use crate::server::HandlerRegistry;

/// What the reactor should do with the connection after a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveOutcome {
    /// Keep the connection registered.
    Continue,
    /// Destroy the connection this iteration.
    Close,
}

/// Dispatch-time collaborators, borrowed from the reactor.
pub(crate) struct DispatchCtx<'a> {
    pub handlers: &'a HandlerRegistry,
    pub resolver: Option<&'a dyn StaticResolver>,
    pub sso: Option<&'a Arc<dyn SsoAuthenticator>>,
}

/// Established WebSocket state.
struct WsSession {
    decoder: FrameDecoder,
    handler: Arc<dyn WebSocketHandler>,
    /// `on_connect` has run (and `on_disconnect` still owes a call).
    connected: bool,
    /// A close frame is queued or sent; the session takes no more input.
    close_sent: bool,
}

enum Phase {
    /// Reading the next request (request line, headers, body all live in
    /// the parser's own state).
    ReadingRequest { parser: RequestParser },
    /// A response is queued; bytes read meanwhile are parked in
    /// `pending` until the flush completes.
    Streaming { keep_alive: bool, pending: Vec<u8> },
    /// 101 sent; frames flow.
    WebSocket(Box<WsSession>),
    /// Flush whatever is queued, then close. Reads are discarded.
    Draining,
}

enum ReadAction {
    None,
    RequestComplete(Request),
    RequestFailed(ParseError),
    WebSocketBytes,
}

enum FlushTransition {
    Idle,
    Close,
    NextRequest(Vec<u8>),
}

pub(crate) struct Connection {
    stream: TcpStream,
    fd: RawFd,
    token: u64,
    addr: SocketAddr,
    output: Vec<u8>,
    bytes_received: u64,
    bytes_sent: u64,
    peer_eof: bool,
    subscribed: Interest,
    phase: Phase,
    request_uri: String,
    credentials: Option<Credentials>,
    max_request_bytes: usize,
    max_ws_message_bytes: usize,
    ws_fragment_threshold: usize,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        addr: SocketAddr,
        token: u64,
        max_request_bytes: usize,
        max_ws_message_bytes: usize,
        ws_fragment_threshold: usize,
    ) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            token,
            addr,
            output: Vec::new(),
            bytes_received: 0,
            bytes_sent: 0,
            peer_eof: false,
            subscribed: Interest::READ,
            phase: Phase::ReadingRequest {
                parser: RequestParser::with_max_request_bytes(max_request_bytes),
            },
            request_uri: String::new(),
            credentials: None,
            max_request_bytes,
            max_ws_message_bytes,
            ws_fragment_threshold,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn request_uri(&self) -> &str {
        &self.request_uri
    }

    pub(crate) fn username(&self) -> &str {
        self.credentials
            .as_ref()
            .map_or("", |creds| creds.username.as_str())
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub(crate) fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Unconsumed input bytes, wherever the current phase buffers them.
    pub(crate) fn input_buffered(&self) -> usize {
        match &self.phase {
            Phase::ReadingRequest { parser } => parser.buffered_len(),
            Phase::Streaming { pending, .. } => pending.len(),
            Phase::WebSocket(ws) => ws.decoder.buffered_len(),
            Phase::Draining => 0,
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        !self.output.is_empty()
    }

    /// The interest this connection should be registered with right now:
    /// writable iff output is queued, readable until the peer has shut
    /// its half down (after EOF a level-triggered readable would fire
    /// forever with nothing to consume).
    pub(crate) fn desired_interest(&self) -> Interest {
        Interest {
            readable: !self.peer_eof,
            writable: !self.output.is_empty(),
        }
    }

    pub(crate) fn subscribed_interest(&self) -> Interest {
        self.subscribed
    }

    pub(crate) fn set_subscribed_interest(&mut self, interest: Interest) {
        self.subscribed = interest;
    }

    /// Stop consuming input and close once queued output has flushed.
    pub(crate) fn begin_draining(&mut self) -> DriveOutcome {
        match &mut self.phase {
            Phase::WebSocket(ws) => ws.close_sent = true,
            phase => *phase = Phase::Draining,
        }
        if self.output.is_empty() {
            DriveOutcome::Close
        } else {
            DriveOutcome::Continue
        }
    }

    /// Drop queued output and report the connection closeable.
    pub(crate) fn discard_output_and_close(&mut self) -> DriveOutcome {
        self.output.clear();
        DriveOutcome::Close
    }

    /// Drive the reader side: `recv` until would-block or EOF.
    pub(crate) fn on_readable(&mut self, ctx: &DispatchCtx) -> DriveOutcome {
        if self.peer_eof {
            return DriveOutcome::Continue;
        }
        let mut buf = [0u8; 8192];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(addr = %self.addr, "peer closed");
                    self.peer_eof = true;
                    return self.begin_draining();
                }
                Ok(n) => {
                    self.bytes_received += n as u64;
                    self.handle_bytes(&buf[..n], ctx);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(addr = %self.addr, error = %err, "read failed");
                    return self.discard_output_and_close();
                }
            }
        }
        DriveOutcome::Continue
    }

    fn handle_bytes(&mut self, bytes: &[u8], ctx: &DispatchCtx) {
        let action = match &mut self.phase {
            Phase::ReadingRequest { parser } => match parser.feed(bytes) {
                Ok(ParseStatus::Complete(request)) => ReadAction::RequestComplete(request),
                Ok(ParseStatus::Incomplete) => ReadAction::None,
                Err(err) => ReadAction::RequestFailed(err),
            },
            Phase::Streaming { pending, .. } => {
                pending.extend_from_slice(bytes);
                ReadAction::None
            }
            Phase::WebSocket(_) => ReadAction::WebSocketBytes,
            Phase::Draining => ReadAction::None,
        };

        match action {
            ReadAction::None => {}
            ReadAction::RequestComplete(request) => {
                let parser = match std::mem::replace(&mut self.phase, Phase::Draining) {
                    Phase::ReadingRequest { parser } => parser,
                    _ => unreachable!("request completion outside ReadingRequest"),
                };
                self.dispatch(request, parser, ctx);
            }
            ReadAction::RequestFailed(err) => self.fail_request(&err),
            ReadAction::WebSocketBytes => self.drive_websocket(bytes, ctx),
        }
    }

    fn fail_request(&mut self, err: &ParseError) {
        tracing::warn!(addr = %self.addr, error = %err, "rejecting malformed request");
        let response = if err.is_too_large() {
            Response::payload_too_large()
        } else {
            Response::bad_request()
        };
        self.enqueue_response(&response, false, false);
        self.phase = Phase::Draining;
    }

    fn enqueue_response(&mut self, response: &Response, keep_alive: bool, head_only: bool) {
        self.output
            .extend_from_slice(&response.to_wire_bytes(keep_alive, head_only));
    }

    /// Evaluate a completed request: SSO, upgrade, static content, 404.
    fn dispatch(&mut self, request: Request, mut parser: RequestParser, ctx: &DispatchCtx) {
        self.request_uri = request.uri().to_string();

        if let Some(sso) = ctx.sso {
            match sso.attempt(&request) {
                Access::Granted(creds) => self.credentials = Some(creds),
                Access::Redirect(response) => {
                    self.enqueue_response(&response, false, false);
                    self.phase = Phase::Draining;
                    return;
                }
                Access::Denied => {
                    tracing::warn!(addr = %self.addr, uri = %self.request_uri, "access denied");
                    self.enqueue_response(&Response::forbidden(), false, false);
                    self.phase = Phase::Draining;
                    return;
                }
            }
        }

        if request.is_websocket_upgrade() {
            self.upgrade(&request, parser, ctx);
            return;
        }

        let keep_alive = request.keep_alive();
        let head_only = request.verb() == Verb::Head;
        match route_static(&request, ctx) {
            Some(response) => {
                self.enqueue_response(&response, keep_alive, head_only);
                self.phase = Phase::Streaming {
                    keep_alive,
                    pending: parser.take_buffered(),
                };
            }
            None => {
                tracing::debug!(addr = %self.addr, uri = %self.request_uri, "not found");
                self.enqueue_response(&Response::not_found(), false, head_only);
                self.phase = Phase::Draining;
            }
        }
    }

    fn upgrade(&mut self, request: &Request, mut parser: RequestParser, ctx: &DispatchCtx) {
        let endpoint = request.path();
        let Some((handler, allow_cross_origin)) = ctx.handlers.lookup(endpoint) else {
            tracing::warn!(addr = %self.addr, endpoint, "upgrade to unknown endpoint");
            self.enqueue_response(&Response::bad_request(), false, false);
            self.phase = Phase::Draining;
            return;
        };

        match upgrade_response(request, allow_cross_origin) {
            Ok(bytes) => {
                tracing::info!(addr = %self.addr, endpoint, "websocket session opened");
                self.output.extend_from_slice(&bytes);
                let leftover = parser.take_buffered();
                self.phase = Phase::WebSocket(Box::new(WsSession {
                    decoder: FrameDecoder::with_max_message_bytes(self.max_ws_message_bytes),
                    handler,
                    connected: false,
                    close_sent: false,
                }));
                self.notify_connect();
                if !leftover.is_empty() {
                    self.drive_websocket(&leftover, ctx);
                }
            }
            Err(err) => {
                tracing::warn!(addr = %self.addr, endpoint, error = %err, "handshake rejected");
                self.enqueue_response(&Response::bad_request(), false, false);
                self.phase = Phase::Draining;
            }
        }
    }

    fn notify_connect(&mut self) {
        let Phase::WebSocket(ws) = &mut self.phase else {
            return;
        };
        ws.connected = true;
        let handler = Arc::clone(&ws.handler);
        let mut session = SessionCx {
            id: SessionId(self.token),
            uri: &self.request_uri,
            addr: self.addr,
            credentials: self.credentials.as_ref(),
            output: &mut self.output,
            close_sent: &mut ws.close_sent,
            fragment_threshold: self.ws_fragment_threshold,
        };
        handler.on_connect(&mut session);
    }

    /// Feed bytes to the frame decoder and deliver resulting events.
    fn drive_websocket(&mut self, bytes: &[u8], _ctx: &DispatchCtx) {
        let Phase::WebSocket(ws) = &mut self.phase else {
            return;
        };
        if ws.close_sent {
            // Close handshake underway; input is discarded.
            return;
        }
        ws.decoder.feed(bytes);
        loop {
            match ws.decoder.next_event() {
                Ok(Some(WsEvent::Message { payload, binary })) => {
                    let handler = Arc::clone(&ws.handler);
                    let mut session = SessionCx {
                        id: SessionId(self.token),
                        uri: &self.request_uri,
                        addr: self.addr,
                        credentials: self.credentials.as_ref(),
                        output: &mut self.output,
                        close_sent: &mut ws.close_sent,
                        fragment_threshold: self.ws_fragment_threshold,
                    };
                    handler.on_message(&mut session, &payload, binary);
                    if ws.close_sent {
                        break;
                    }
                }
                Ok(Some(WsEvent::Ping(payload))) => {
                    self.output.extend_from_slice(&encode_pong(&payload));
                }
                Ok(Some(WsEvent::Pong(_))) => {}
                Ok(Some(WsEvent::Close { code })) => {
                    tracing::debug!(addr = %self.addr, ?code, "close received");
                    let reply = match code {
                        Some(code) => encode_close(code),
                        None => encode_frame(true, Opcode::Close, &[]),
                    };
                    self.output.extend_from_slice(&reply);
                    ws.close_sent = true;
                    break;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(addr = %self.addr, error = %err, "websocket failure");
                    self.output.extend_from_slice(&encode_close(err.close_code()));
                    ws.close_sent = true;
                    break;
                }
            }
        }
    }

    /// Drive the writer side: `send` until would-block or the buffer
    /// empties, then run any phase transition the flush unblocks.
    ///
    /// Safe to call with an empty output buffer; a spurious writable
    /// event just falls through the transitions and returns.
    pub(crate) fn on_writable(&mut self, ctx: &DispatchCtx) -> DriveOutcome {
        loop {
            while !self.output.is_empty() {
                match self.stream.write(&self.output) {
                    Ok(0) => return self.discard_output_and_close(),
                    Ok(n) => {
                        self.bytes_sent += n as u64;
                        self.output.drain(..n);
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return DriveOutcome::Continue;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::warn!(addr = %self.addr, error = %err, "write failed");
                        return self.discard_output_and_close();
                    }
                }
            }

            let transition = match &mut self.phase {
                Phase::Streaming {
                    keep_alive,
                    pending,
                } => {
                    if *keep_alive {
                        FlushTransition::NextRequest(std::mem::take(pending))
                    } else {
                        FlushTransition::Close
                    }
                }
                Phase::Draining => FlushTransition::Close,
                Phase::WebSocket(ws) if ws.close_sent => FlushTransition::Close,
                _ => FlushTransition::Idle,
            };

            match transition {
                FlushTransition::Idle => return DriveOutcome::Continue,
                FlushTransition::Close => return DriveOutcome::Close,
                FlushTransition::NextRequest(pending) => {
                    self.phase = Phase::ReadingRequest {
                        parser: RequestParser::with_max_request_bytes(self.max_request_bytes),
                    };
                    if !pending.is_empty() {
                        self.handle_bytes(&pending, ctx);
                    }
                    if self.output.is_empty() {
                        return DriveOutcome::Continue;
                    }
                    // A pipelined request produced another response; go
                    // flush it.
                }
            }
        }
    }

    /// Run a closure against the live session, if there is one.
    pub(crate) fn with_session<F>(&mut self, f: F) -> bool
    where
        F: FnOnce(&mut dyn Session),
    {
        let Phase::WebSocket(ws) = &mut self.phase else {
            return false;
        };
        if !ws.connected || ws.close_sent {
            return false;
        }
        let mut session = SessionCx {
            id: SessionId(self.token),
            uri: &self.request_uri,
            addr: self.addr,
            credentials: self.credentials.as_ref(),
            output: &mut self.output,
            close_sent: &mut ws.close_sent,
            fragment_threshold: self.ws_fragment_threshold,
        };
        f(&mut session);
        true
    }

    /// Deliver `on_disconnect` if `on_connect` ran. Called exactly once,
    /// right before the connection is destroyed.
    pub(crate) fn teardown(&mut self) {
        let Phase::WebSocket(ws) = &mut self.phase else {
            return;
        };
        if !ws.connected {
            return;
        }
        ws.connected = false;
        let handler = Arc::clone(&ws.handler);
        let mut session = SessionCx {
            id: SessionId(self.token),
            uri: &self.request_uri,
            addr: self.addr,
            credentials: self.credentials.as_ref(),
            output: &mut self.output,
            close_sent: &mut ws.close_sent,
            fragment_threshold: self.ws_fragment_threshold,
        };
        handler.on_disconnect(&mut session);
    }
}

/// GET/HEAD against the static resolver; anything else 404s.
fn route_static(request: &Request, ctx: &DispatchCtx) -> Option<Response> {
    if !matches!(request.verb(), Verb::Get | Verb::Head) {
        return None;
    }
    let resolver = ctx.resolver?;
    let content = resolver.resolve(request.path())?;
    match content.last_modified {
        Some(modified) => {
            let stamp = http_date(modified);
            if request.headers().get("if-modified-since") == Some(stamp.as_str()) {
                return Some(
                    Response::new(StatusCode::NOT_MODIFIED).header("Last-Modified", stamp),
                );
            }
            Some(
                Response::ok()
                    .header("Content-Type", content.content_type)
                    .header("Last-Modified", stamp)
                    .body(content.bytes),
            )
        }
        None => Some(
            Response::ok()
                .header("Content-Type", content.content_type)
                .body(content.bytes),
        ),
    }
}

/// Concrete [`Session`] handed to handler callbacks and scheduled tasks.
///
/// Borrows disjoint pieces of the connection, so the handler can push
/// frames while the decoder state stays untouched.
struct SessionCx<'a> {
    id: SessionId,
    uri: &'a str,
    addr: SocketAddr,
    credentials: Option<&'a Credentials>,
    output: &'a mut Vec<u8>,
    close_sent: &'a mut bool,
    fragment_threshold: usize,
}

impl Session for SessionCx<'_> {
    fn id(&self) -> SessionId {
        self.id
    }

    fn request_uri(&self) -> &str {
        self.uri
    }

    fn remote_address(&self) -> SocketAddr {
        self.addr
    }

    fn credentials(&self) -> Option<&Credentials> {
        self.credentials
    }

    fn send_text(&mut self, text: &str) {
        if !*self.close_sent {
            self.output
                .extend_from_slice(&encode_message(text.as_bytes(), false, self.fragment_threshold));
        }
    }

    fn send_binary(&mut self, data: &[u8]) {
        if !*self.close_sent {
            self.output
                .extend_from_slice(&encode_message(data, true, self.fragment_threshold));
        }
    }

    fn close(&mut self, code: u16) {
        if !*self.close_sent {
            self.output.extend_from_slice(&encode_close(code));
            *self.close_sent = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HandlerRegistry;
    use quay_core::StaticContent;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::time::Duration;

    struct OneFile;

    impl StaticResolver for OneFile {
        fn resolve(&self, uri_path: &str) -> Option<StaticContent> {
            (uri_path == "/index.html").then(|| StaticContent {
                bytes: b"<h1>hi</h1>".to_vec(),
                content_type: "text/html; charset=utf-8",
                last_modified: None,
            })
        }
    }

    struct Echo;

    impl WebSocketHandler for Echo {
        fn on_message(&self, session: &mut dyn Session, payload: &[u8], binary: bool) {
            if binary {
                session.send_binary(payload);
            } else {
                session.send_text(std::str::from_utf8(payload).unwrap());
            }
        }
    }

    /// A connected (client, server-side Connection) pair with the server
    /// end non-blocking, the client end blocking with a read timeout.
    fn pair() -> (std::net::TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        let (stream, peer) = listener.accept().expect("accept");
        stream.set_nonblocking(true).expect("nonblocking");
        (
            client,
            Connection::new(stream, peer, 9, 1024 * 1024, 1 << 20, 64 * 1024),
        )
    }

    fn empty_registry() -> HandlerRegistry {
        HandlerRegistry::new()
    }

    fn drive(conn: &mut Connection, ctx: &DispatchCtx) -> DriveOutcome {
        let read = conn.on_readable(ctx);
        let write = conn.on_writable(ctx);
        if read == DriveOutcome::Close || write == DriveOutcome::Close {
            DriveOutcome::Close
        } else {
            DriveOutcome::Continue
        }
    }

    fn read_response(client: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Err(err) => panic!("client read failed: {err}"),
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn serves_static_file_and_keeps_alive() {
        let (mut client, mut conn) = pair();
        let handlers = empty_registry();
        let ctx = DispatchCtx {
            handlers: &handlers,
            resolver: Some(&OneFile),
            sso: None,
        };

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(drive(&mut conn, &ctx), DriveOutcome::Continue);

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.contains("Content-Length: 11\r\n"));
    }

    #[test]
    fn unknown_path_is_404_and_drains() {
        let (mut client, mut conn) = pair();
        let handlers = empty_registry();
        let ctx = DispatchCtx {
            handlers: &handlers,
            resolver: Some(&OneFile),
            sso: None,
        };

        client
            .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(drive(&mut conn, &ctx), DriveOutcome::Close);

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Connection: close\r\n"));
    }

    #[test]
    fn spurious_writable_with_empty_output_is_a_noop() {
        let (_client, mut conn) = pair();
        let handlers = empty_registry();
        let ctx = DispatchCtx {
            handlers: &handlers,
            resolver: None,
            sso: None,
        };
        assert_eq!(conn.on_writable(&ctx), DriveOutcome::Continue);
        assert_eq!(conn.bytes_sent(), 0);
        assert!(!conn.wants_write());
    }

    #[test]
    fn websocket_upgrade_then_echo() {
        let (mut client, mut conn) = pair();
        let mut handlers = HandlerRegistry::new();
        handlers.register("/echo", Arc::new(Echo), false);
        let ctx = DispatchCtx {
            handlers: &handlers,
            resolver: None,
            sso: None,
        };

        client
            .write_all(
                b"GET /echo HTTP/1.1\r\n\
                  Host: x\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(drive(&mut conn, &ctx), DriveOutcome::Continue);

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        // Masked text frame "hello".
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x81, 0x85];
        frame.extend_from_slice(&mask);
        for (i, &b) in b"hello".iter().enumerate() {
            frame.push(b ^ mask[i & 3]);
        }
        client.write_all(&frame).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(drive(&mut conn, &ctx), DriveOutcome::Continue);

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"\x81\x05hello");
    }

    #[test]
    fn close_frame_gets_echoed_and_connection_drains() {
        let (mut client, mut conn) = pair();
        let mut handlers = HandlerRegistry::new();
        handlers.register("/echo", Arc::new(Echo), false);
        let ctx = DispatchCtx {
            handlers: &handlers,
            resolver: None,
            sso: None,
        };

        client
            .write_all(
                b"GET /echo HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drive(&mut conn, &ctx);
        let _ = read_response(&mut client);

        // Masked close frame, code 1000.
        let mask = [9u8, 9, 9, 9];
        let payload = 1000u16.to_be_bytes();
        let mut frame = vec![0x88, 0x82];
        frame.extend_from_slice(&mask);
        for (i, &b) in payload.iter().enumerate() {
            frame.push(b ^ mask[i & 3]);
        }
        client.write_all(&frame).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(drive(&mut conn, &ctx), DriveOutcome::Close);

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, &[0x88, 0x02, 0x03, 0xE8]);
    }
}
