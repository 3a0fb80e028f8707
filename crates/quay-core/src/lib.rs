//! Shared types for the quay embeddable web server.
//!
//! This crate holds everything the wire codecs and the reactor agree on:
//! request/response types, the static content resolver, the SSO
//! authenticator interface, and the WebSocket handler traits the
//! embedding application implements.

#![deny(unsafe_code)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod auth;
mod handler;
mod request;
mod response;
mod static_files;

pub use auth::{Access, Credentials, SsoAuthenticator};
pub use handler::{Session, SessionId, WebSocketHandler};
pub use request::{Headers, HttpVersion, Request, Verb};
pub use response::{Response, StatusCode, http_date, mime_type_for_extension};
pub use static_files::{DirResolver, StaticContent, StaticResolver};
