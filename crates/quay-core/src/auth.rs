//! Single-sign-on collaborator interface.
//!
//! The server never interprets credentials; it stores whatever the
//! authenticator returns and exposes it to WebSocket sessions and the
//! stats document.

use std::collections::HashMap;

use crate::request::Request;
use crate::response::Response;

/// Opaque credentials attached to an authenticated connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Authenticated user name.
    pub username: String,
    /// Provider-specific attributes.
    pub attributes: HashMap<String, String>,
}

impl Credentials {
    /// Credentials for a named user with no attributes.
    #[must_use]
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            attributes: HashMap::new(),
        }
    }
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone)]
pub enum Access {
    /// Request is authenticated; credentials travel with the connection.
    Granted(Credentials),
    /// Request must be redirected (e.g. to the SSO provider).
    Redirect(Response),
    /// Request is rejected outright.
    Denied,
}

/// Validates requests against a single-sign-on provider.
///
/// Consulted on the reactor thread at dispatch time, once per parsed
/// request, before static resolution or WebSocket upgrade.
pub trait SsoAuthenticator: Send + Sync {
    /// Inspect a parsed request and decide access.
    fn attempt(&self, request: &Request) -> Access;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{HttpVersion, Verb};

    struct HeaderAuth;

    impl SsoAuthenticator for HeaderAuth {
        fn attempt(&self, request: &Request) -> Access {
            match request.headers().get("x-user") {
                Some(user) => Access::Granted(Credentials::for_user(user)),
                None => Access::Redirect(Response::redirect("https://sso.example/login")),
            }
        }
    }

    #[test]
    fn grants_with_header() {
        let mut req = Request::new(Verb::Get, "/", HttpVersion::Http11);
        req.headers_mut().insert("X-User", "alice");
        match HeaderAuth.attempt(&req) {
            Access::Granted(creds) => assert_eq!(creds.username, "alice"),
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn redirects_without_header() {
        let req = Request::new(Verb::Get, "/", HttpVersion::Http11);
        assert!(matches!(HeaderAuth.attempt(&req), Access::Redirect(_)));
    }
}
