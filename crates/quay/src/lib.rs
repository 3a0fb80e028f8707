//! quay: an embeddable single-threaded HTTP/1.1 + WebSocket server.
//!
//! A host program links quay to expose lightweight web endpoints and
//! bidirectional message channels. The core is an event-driven
//! connection multiplexer: one thread (the caller of
//! [`Server::serve`]) runs the reactor and owns all connection state;
//! other threads interact only through [`ServerHandle::schedule`] and
//! [`ServerHandle::terminate`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use quay::{Server, ServerConfig, Session, WebSocketHandler};
//!
//! struct Echo;
//!
//! impl WebSocketHandler for Echo {
//!     fn on_message(&self, session: &mut dyn Session, payload: &[u8], binary: bool) {
//!         if binary {
//!             session.send_binary(payload);
//!         } else if let Ok(text) = std::str::from_utf8(payload) {
//!             session.send_text(text);
//!         }
//!     }
//! }
//!
//! let mut server = Server::new(ServerConfig::default());
//! server.add_web_socket_handler("/echo", Arc::new(Echo), false);
//! server.serve("web", 9090).expect("server start");
//! ```

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

mod connection;
mod net;
mod poller;
mod registry;
mod server;
mod tasks;
mod wakeup;

pub use server::{
    DEFAULT_LAME_CONNECTION_TIMEOUT_SECS, Reactor, Server, ServerConfig, ServerError, ServerHandle,
};
pub use tasks::Task;

// The shared vocabulary types, so embedders need only this crate.
pub use quay_core::{
    Access, Credentials, DirResolver, Headers, HttpVersion, Request, Response, Session, SessionId,
    SsoAuthenticator, StaticContent, StaticResolver, StatusCode, Verb, WebSocketHandler,
};
