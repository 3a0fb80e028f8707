//! The server: accept loop, readiness dispatch, task execution, lame
//! connection reaping, and the embedding API.
//!
//! One thread — the one that calls [`Server::serve`] — becomes the
//! reactor and owns every connection. Other threads interact through a
//! [`ServerHandle`]: [`ServerHandle::schedule`] enqueues a closure that
//! runs on the reactor thread, and [`ServerHandle::terminate`] requests
//! an orderly shutdown. Both wake the reactor through its self-pipe.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use quay_core::{DirResolver, Session, SessionId, SsoAuthenticator, StaticResolver, WebSocketHandler};
use quay_http::{DEFAULT_FRAGMENT_THRESHOLD, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_REQUEST_BYTES};

use crate::connection::{Connection, DispatchCtx, DriveOutcome};
use crate::net;
use crate::poller::{EVENT_BATCH, Interest, PollEvent, Poller};
use crate::registry::Registry;
use crate::tasks::{Task, TaskQueue};
use crate::wakeup::{WakePipe, notify};

const TOKEN_LISTENER: u64 = 0;
const TOKEN_WAKE: u64 = 1;
const FIRST_CONNECTION_TOKEN: u64 = 2;

/// How often the registry is scanned for lame connections.
const LAME_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout after which a silent connection is reaped.
pub const DEFAULT_LAME_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Poll wait bound; short enough that reaping happens under quiet load.
const POLL_TIMEOUT_MS: i32 = 500;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Reap connections that sent nothing for this long.
    pub lame_connection_timeout: Duration,
    /// Cap on a single HTTP request (request line + headers + body).
    pub max_request_bytes: usize,
    /// Cap on an assembled WebSocket message.
    pub max_ws_message_bytes: usize,
    /// Outgoing messages above this size are fragmented.
    pub ws_fragment_threshold: usize,
    /// Listen backlog.
    pub listen_backlog: i32,
    /// `SO_LINGER` timeout applied to accepted sockets.
    pub linger_secs: u16,
}

impl ServerConfig {
    /// Create a configuration with the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lame_connection_timeout: Duration::from_secs(DEFAULT_LAME_CONNECTION_TIMEOUT_SECS),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_ws_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            ws_fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            listen_backlog: 5,
            linger_secs: 5,
        }
    }

    /// Set the lame connection timeout.
    #[must_use]
    pub fn with_lame_connection_timeout(mut self, timeout: Duration) -> Self {
        self.lame_connection_timeout = timeout;
        self
    }

    /// Set the per-request byte cap.
    #[must_use]
    pub fn with_max_request_bytes(mut self, limit: usize) -> Self {
        self.max_request_bytes = limit;
        self
    }

    /// Set the WebSocket message cap.
    #[must_use]
    pub fn with_max_ws_message_bytes(mut self, limit: usize) -> Self {
        self.max_ws_message_bytes = limit;
        self
    }

    /// Set the outgoing fragmentation threshold.
    #[must_use]
    pub fn with_ws_fragment_threshold(mut self, threshold: usize) -> Self {
        self.ws_fragment_threshold = threshold;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Startup or listener-fatal server error.
#[derive(Debug)]
pub enum ServerError {
    /// Creating or binding the listening socket failed.
    Bind(io::Error),
    /// Creating the readiness poller failed.
    Poller(io::Error),
    /// Creating the wakeup pipe failed.
    WakePipe(io::Error),
    /// The poll wait failed mid-loop.
    Poll(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "unable to bind listen socket: {e}"),
            Self::Poller(e) => write!(f, "unable to create poller: {e}"),
            Self::WakePipe(e) => write!(f, "unable to create wakeup pipe: {e}"),
            Self::Poll(e) => write!(f, "poll wait failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(e) | Self::Poller(e) | Self::WakePipe(e) | Self::Poll(e) => Some(e),
        }
    }
}

/// Endpoint → (handler, allow-cross-origin). Exact path match, query
/// string already stripped by the dispatcher.
#[derive(Default, Clone)]
pub(crate) struct HandlerRegistry {
    map: HashMap<String, (Arc<dyn WebSocketHandler>, bool)>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        endpoint: &str,
        handler: Arc<dyn WebSocketHandler>,
        allow_cross_origin: bool,
    ) {
        self.map
            .insert(endpoint.to_string(), (handler, allow_cross_origin));
    }

    pub(crate) fn lookup(&self, endpoint: &str) -> Option<(Arc<dyn WebSocketHandler>, bool)> {
        self.map.get(endpoint).cloned()
    }
}

/// State shared between the reactor thread and the rest of the process.
///
/// Nothing else crosses threads: the task queue is mutex-guarded, the
/// flags are atomics, and everything per-connection stays reactor-local.
struct Shared {
    terminate: AtomicBool,
    wake_fd: AtomicI32,
    local_port: AtomicU16,
    tasks: TaskQueue,
}

impl Shared {
    fn new() -> Self {
        Self {
            terminate: AtomicBool::new(false),
            wake_fd: AtomicI32::new(-1),
            local_port: AtomicU16::new(0),
            tasks: TaskQueue::new(),
        }
    }

    fn schedule(&self, task: Task) {
        self.tasks.push(task);
        notify(self.wake_fd.load(Ordering::Acquire));
    }

    fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        notify(self.wake_fd.load(Ordering::Acquire));
    }
}

/// Cloneable, `Send` handle for cross-thread interaction with a running
/// (or not-yet-running) server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Enqueue a closure to run on the reactor thread.
    ///
    /// Fire-and-forget: callers needing a reply pair the task with their
    /// own completion primitive. Scheduling before `serve` is fine; the
    /// backlog runs at the top of the first loop iteration.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.shared.schedule(Box::new(task));
    }

    /// Request an orderly shutdown from any thread.
    pub fn terminate(&self) {
        self.shared.request_terminate();
    }

    /// The bound port, once `serve` has set up its listener.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        match self.shared.local_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }
}

/// The embeddable server.
///
/// Register WebSocket handlers and configuration first, then call
/// [`serve`](Server::serve); the calling thread becomes the reactor
/// until [`terminate`](Server::terminate) is observed.
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    handlers: HandlerRegistry,
    sso: Option<Arc<dyn SsoAuthenticator>>,
}

impl Server {
    /// Create a server with the given configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            handlers: HandlerRegistry::new(),
            sso: None,
        }
    }

    /// A cross-thread handle to this server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a WebSocket handler for an endpoint. Pre-`serve` only.
    pub fn add_web_socket_handler(
        &mut self,
        endpoint: &str,
        handler: Arc<dyn WebSocketHandler>,
        allow_cross_origin: bool,
    ) {
        self.handlers.register(endpoint, handler, allow_cross_origin);
    }

    /// Install a single-sign-on authenticator. Pre-`serve` only.
    pub fn enable_single_sign_on(&mut self, sso: Arc<dyn SsoAuthenticator>) {
        self.sso = Some(sso);
    }

    /// Adjust the lame connection timeout. Pre-`serve` only.
    pub fn set_lame_connection_timeout_secs(&mut self, secs: u64) {
        tracing::info!(secs, "setting lame connection timeout");
        self.config.lame_connection_timeout = Duration::from_secs(secs);
    }

    /// See [`ServerHandle::schedule`].
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.shared.schedule(Box::new(task));
    }

    /// See [`ServerHandle::terminate`].
    pub fn terminate(&self) {
        self.shared.request_terminate();
    }

    /// Serve static content from `static_path` and WebSocket endpoints on
    /// `port`, blocking until terminated. The calling thread becomes the
    /// reactor thread.
    pub fn serve(&mut self, static_path: impl Into<PathBuf>, port: u16) -> Result<(), ServerError> {
        self.serve_with_resolver(Box::new(DirResolver::new(static_path.into())), port)
    }

    /// Like [`serve`](Server::serve) with a custom content resolver.
    pub fn serve_with_resolver(
        &mut self,
        resolver: Box<dyn StaticResolver>,
        port: u16,
    ) -> Result<(), ServerError> {
        let listener =
            net::bind_listener(port, self.config.listen_backlog).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let mut poller = Poller::new().map_err(ServerError::Poller)?;
        let wake = WakePipe::new().map_err(ServerError::WakePipe)?;
        poller
            .register(listener.as_raw_fd(), TOKEN_LISTENER, Interest::READ)
            .map_err(ServerError::Poller)?;
        poller
            .register(wake.read_fd(), TOKEN_WAKE, Interest::READ)
            .map_err(ServerError::Poller)?;

        self.shared.wake_fd.store(wake.write_fd(), Ordering::Release);
        self.shared
            .local_port
            .store(local_addr.port(), Ordering::Release);

        tracing::info!("listening on http://{local_addr}");

        let mut reactor = Reactor {
            poller,
            registry: Registry::new(),
            handlers: self.handlers.clone(),
            resolver,
            sso: self.sso.clone(),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            next_token: FIRST_CONNECTION_TOKEN,
            next_lame_check: Instant::now(),
        };

        let result = run_loop(&mut reactor, &listener, &wake);

        // Shutdown destroys every remaining connection before the poller
        // and sockets close.
        for token in reactor.registry.tokens() {
            reactor.destroy_connection(token);
        }
        self.shared.wake_fd.store(-1, Ordering::Release);
        self.shared.local_port.store(0, Ordering::Release);
        tracing::info!("server shut down");
        result
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

/// Reactor-thread state, visible to scheduled tasks.
pub struct Reactor {
    poller: Poller,
    registry: Registry,
    handlers: HandlerRegistry,
    resolver: Box<dyn StaticResolver>,
    sso: Option<Arc<dyn SsoAuthenticator>>,
    config: ServerConfig,
    shared: Arc<Shared>,
    next_token: u64,
    next_lame_check: Instant,
}

impl Reactor {
    /// Run a closure against a live WebSocket session.
    ///
    /// Returns false when the session is gone (or was never upgraded);
    /// the work is silently dropped, matching the fire-and-forget task
    /// contract. Output produced by the closure is flushed before
    /// returning.
    pub fn with_session<F>(&mut self, id: SessionId, f: F) -> bool
    where
        F: FnOnce(&mut dyn Session),
    {
        let token = id.0;
        let Some(tracked) = self.registry.get_mut(token) else {
            return false;
        };
        let delivered = tracked.conn.with_session(f);

        let ctx = DispatchCtx {
            handlers: &self.handlers,
            resolver: Some(&*self.resolver),
            sso: self.sso.as_ref(),
        };
        let outcome = tracked.conn.on_writable(&ctx);
        match outcome {
            DriveOutcome::Close => {
                self.destroy_connection(token);
            }
            DriveOutcome::Continue => {
                sync_write_interest(&self.poller, &mut tracked.conn);
            }
        }
        delivered
    }

    /// Request shutdown, as [`ServerHandle::terminate`] does.
    pub fn terminate(&self) {
        self.shared.request_terminate();
    }

    /// A cross-thread handle to this server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Textual stats document: one line per active connection.
    #[must_use]
    pub fn stats_document(&self) -> String {
        let mut doc = String::from("clear();\n");
        for (token, tracked) in self.registry.iter() {
            let conn = &tracked.conn;
            let since = tracked
                .since
                .duration_since(UNIX_EPOCH)
                .map_or(0, |age| age.as_secs());
            doc.push_str(&format!(
                "connection({{\"since\":{since},\"fd\":{},\"id\":{token},\"uri\":{:?},\
                 \"addr\":{:?},\"user\":{:?},\"input\":{},\"read\":{},\"output\":{},\
                 \"written\":{}}});\n",
                conn.fd(),
                conn.request_uri(),
                conn.addr().to_string(),
                conn.username(),
                conn.input_buffered(),
                conn.bytes_received(),
                conn.output_len(),
                conn.bytes_sent(),
            ));
        }
        doc
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Remove, tear down, and drop a connection. False if the token is
    /// unknown.
    fn destroy_connection(&mut self, token: u64) -> bool {
        let Some(mut conn) = self.registry.remove(token) else {
            return false;
        };
        tracing::debug!(addr = %conn.addr(), fd = conn.fd(), "destroying connection");
        conn.teardown();
        if let Err(err) = self.poller.deregister(conn.fd()) {
            tracing::warn!(error = %err, "unable to remove connection from poller");
        }
        true
    }
}

/// Re-arm the registration to match the connection: writable interest
/// iff output is queued, read interest until peer EOF. Level-triggered,
/// so this is the single place the buffer/subscription invariant is
/// kept.
fn sync_write_interest(poller: &Poller, conn: &mut Connection) {
    let want = conn.desired_interest();
    if want == conn.subscribed_interest() {
        return;
    }
    match poller.modify(conn.fd(), conn.token(), want) {
        Ok(()) => conn.set_subscribed_interest(want),
        Err(err) => {
            tracing::warn!(addr = %conn.addr(), error = %err, "unable to update write interest");
        }
    }
}

fn run_loop(
    reactor: &mut Reactor,
    listener: &TcpListener,
    wake: &WakePipe,
) -> Result<(), ServerError> {
    let mut events: Vec<PollEvent> = Vec::with_capacity(EVENT_BATCH);
    let mut last_full_batch_warning: Option<Instant> = None;

    while !reactor.shared.terminate.load(Ordering::Acquire) {
        // Tasks first, so work scheduled before serve() is not stranded
        // behind the first poll wait.
        for task in reactor.shared.tasks.drain() {
            task(reactor);
        }
        if reactor.shared.terminate.load(Ordering::Acquire) {
            break;
        }

        let batch = match reactor.poller.wait(&mut events, POLL_TIMEOUT_MS) {
            Ok(n) => n,
            Err(err) => {
                tracing::error!(error = %err, "poll wait failed");
                return Err(ServerError::Poll(err));
            }
        };
        if batch == EVENT_BATCH {
            let now = Instant::now();
            let warn_due = last_full_batch_warning
                .map_or(true, |last| now.duration_since(last) >= Duration::from_secs(60));
            if warn_due {
                tracing::warn!(
                    "full event batch; may start starving connections (warning at most once a minute)"
                );
                last_full_batch_warning = Some(now);
            }
        }

        let mut to_delete: Vec<u64> = Vec::new();
        for i in 0..events.len() {
            let event = events[i];
            match event.token {
                TOKEN_LISTENER => {
                    if event.readiness.unexpected() || event.readiness.hangup() {
                        tracing::error!(
                            readiness = %event.readiness,
                            "unexpected event on listening socket - terminating"
                        );
                        reactor.shared.terminate.store(true, Ordering::Release);
                        break;
                    }
                    if event.readiness.readable() {
                        accept_new_connections(reactor, listener);
                    }
                }
                TOKEN_WAKE => {
                    if event.readiness.unexpected() || event.readiness.hangup() {
                        tracing::error!(
                            readiness = %event.readiness,
                            "unexpected event on wakeup pipe - terminating"
                        );
                        reactor.shared.terminate.store(true, Ordering::Release);
                        break;
                    }
                    // Drain; queued tasks run at the top of the next
                    // iteration.
                    wake.drain();
                }
                token => drive_connection(reactor, token, event, &mut to_delete),
            }
        }

        reap_lame_connections(reactor, &mut to_delete);

        to_delete.sort_unstable();
        to_delete.dedup();
        for token in to_delete {
            if !reactor.destroy_connection(token) {
                tracing::error!(token, "attempt to delete a connection we didn't know about");
                reactor.shared.terminate.store(true, Ordering::Release);
            }
        }
    }
    Ok(())
}

fn accept_new_connections(reactor: &mut Reactor, listener: &TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if reactor.shared.terminate.load(Ordering::Acquire) {
                    // Shutting down: close without entering the registry.
                    continue;
                }
                if let Err(err) = stream.set_nonblocking(true) {
                    tracing::error!(%addr, error = %err, "unable to make socket non-blocking");
                    continue;
                }
                let fd = stream.as_raw_fd();
                if let Err(err) = net::set_linger(fd, reactor.config.linger_secs) {
                    tracing::error!(%addr, error = %err, "unable to set linger option");
                    continue;
                }
                let token = reactor.next_token;
                reactor.next_token += 1;
                let conn = Connection::new(
                    stream,
                    addr,
                    token,
                    reactor.config.max_request_bytes,
                    reactor.config.max_ws_message_bytes,
                    reactor.config.ws_fragment_threshold,
                );
                if let Err(err) = reactor.poller.register(fd, token, Interest::READ) {
                    tracing::error!(%addr, error = %err, "unable to add socket to poller");
                    continue;
                }
                tracing::info!(%addr, fd, "accepted connection");
                reactor.registry.insert(token, conn);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(error = %err, "unable to accept");
                break;
            }
        }
    }
}

fn drive_connection(reactor: &mut Reactor, token: u64, event: PollEvent, to_delete: &mut Vec<u64>) {
    let ctx = DispatchCtx {
        handlers: &reactor.handlers,
        resolver: Some(&*reactor.resolver),
        sso: reactor.sso.as_ref(),
    };
    let Some(tracked) = reactor.registry.get_mut(token) else {
        // Event raced with a deletion earlier in this batch.
        return;
    };
    let conn = &mut tracked.conn;
    let readiness = event.readiness;

    let outcome = if readiness.unexpected() {
        tracing::warn!(
            addr = %conn.addr(),
            readiness = %readiness,
            "poller error event on connection"
        );
        conn.discard_output_and_close()
    } else if readiness.hangup_only() {
        tracing::debug!(addr = %conn.addr(), "graceful hang-up");
        conn.begin_draining()
    } else {
        // Writable first, to relieve backpressure before producing more.
        let mut outcome = DriveOutcome::Continue;
        if readiness.writable() {
            outcome = conn.on_writable(&ctx);
        }
        if outcome == DriveOutcome::Continue && readiness.readable() {
            outcome = conn.on_readable(&ctx);
            if outcome == DriveOutcome::Continue {
                // Flush whatever the reads produced.
                outcome = conn.on_writable(&ctx);
            }
        }
        outcome
    };

    match outcome {
        DriveOutcome::Close => to_delete.push(token),
        DriveOutcome::Continue => sync_write_interest(&reactor.poller, conn),
    }
}

fn reap_lame_connections(reactor: &mut Reactor, to_delete: &mut Vec<u64>) {
    let now = Instant::now();
    if now < reactor.next_lame_check {
        return;
    }
    reactor.next_lame_check = now + LAME_CHECK_INTERVAL;

    let wall_now = SystemTime::now();
    for (token, tracked) in reactor.registry.iter() {
        if tracked.conn.bytes_received() != 0 {
            continue;
        }
        let age = wall_now
            .duration_since(tracked.since)
            .unwrap_or(Duration::ZERO);
        if age >= reactor.config.lame_connection_timeout {
            tracing::warn!(
                addr = %tracked.conn.addr(),
                age_secs = age.as_secs(),
                "killing lame connection - no bytes received"
            );
            to_delete.push(token);
        }
    }
}
