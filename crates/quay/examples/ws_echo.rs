//! Minimal embedding: serve a directory and echo WebSocket messages at
//! `/echo`, with a background thread pushing a heartbeat through the
//! task queue.
//!
//! Run with `cargo run --example ws_echo -- <static-dir> [port]`.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use quay::{Server, ServerConfig, Session, SessionId, WebSocketHandler};

struct Echo {
    sessions: Mutex<Vec<SessionId>>,
}

impl WebSocketHandler for Echo {
    fn on_connect(&self, session: &mut dyn Session) {
        tracing::info!(id = %session.id(), addr = %session.remote_address(), "connected");
        self.sessions.lock().unwrap().push(session.id());
    }

    fn on_message(&self, session: &mut dyn Session, payload: &[u8], binary: bool) {
        if binary {
            session.send_binary(payload);
        } else if let Ok(text) = std::str::from_utf8(payload) {
            session.send_text(text);
        }
    }

    fn on_disconnect(&self, session: &mut dyn Session) {
        tracing::info!(id = %session.id(), "disconnected");
        let id = session.id();
        self.sessions.lock().unwrap().retain(|s| *s != id);
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let static_dir = args.next().unwrap_or_else(|| "web".to_string());
    let port: u16 = args
        .next()
        .map(|p| p.parse().expect("port must be a number"))
        .unwrap_or(9090);

    let echo = Arc::new(Echo {
        sessions: Mutex::new(Vec::new()),
    });

    let mut server = Server::new(ServerConfig::default());
    server.add_web_socket_handler("/echo", Arc::clone(&echo) as Arc<dyn WebSocketHandler>, true);

    // A foreign thread may only talk to sessions through scheduled tasks.
    let handle = server.handle();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(30));
        let echo = Arc::clone(&echo);
        handle.schedule(move |reactor| {
            // Snapshot first: with_session may tear a dead connection
            // down, and on_disconnect takes the same lock.
            let ids: Vec<_> = echo.sessions.lock().unwrap().clone();
            for id in ids {
                reactor.with_session(id, |session| session.send_text("heartbeat"));
            }
        });
    });

    if let Err(err) = server.serve(static_dir, port) {
        tracing::error!(error = %err, "server failed");
        std::process::exit(1);
    }
}
