//! WebSocket handler and session interfaces.
//!
//! Handlers are supplied by the embedding application and registered per
//! endpoint before the server starts. All callbacks run on the reactor
//! thread; a handler that needs to push data from elsewhere captures the
//! [`SessionId`] and schedules a task back onto the reactor.

use std::fmt;
use std::net::SocketAddr;

use crate::auth::Credentials;

/// Stable identifier for a WebSocket session.
///
/// Valid for the lifetime of the underlying connection; sends to a
/// departed session are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The server side of an established WebSocket connection.
///
/// Sends enqueue encoded frames on the connection's output buffer and
/// never block; backpressure is absorbed by the buffer and drained on
/// writable readiness.
pub trait Session {
    /// The session identifier.
    fn id(&self) -> SessionId;
    /// The URI of the upgrade request.
    fn request_uri(&self) -> &str;
    /// The peer address.
    fn remote_address(&self) -> SocketAddr;
    /// Credentials established by the SSO authenticator, if any.
    fn credentials(&self) -> Option<&Credentials>;
    /// Send a text message.
    fn send_text(&mut self, text: &str);
    /// Send a binary message.
    fn send_binary(&mut self, data: &[u8]);
    /// Start the close handshake with the given close code (1000 for a
    /// normal close). The connection drains and shuts once the close
    /// frame is flushed.
    fn close(&mut self, code: u16);
}

/// Application callbacks for one WebSocket endpoint.
///
/// One handler instance serves every session on its endpoint; per-session
/// state is keyed by [`SessionId`]. Implementations needing mutable state
/// guard it themselves (the callbacks only ever run on the reactor
/// thread, but the registry hands out shared references).
pub trait WebSocketHandler: Send + Sync {
    /// The handshake completed and the session is live.
    fn on_connect(&self, _session: &mut dyn Session) {}

    /// A complete (defragmented) message arrived.
    fn on_message(&self, session: &mut dyn Session, payload: &[u8], binary: bool);

    /// The session is going away. Called exactly once per connected
    /// session, whatever the cause of death.
    fn on_disconnect(&self, _session: &mut dyn Session) {}
}
