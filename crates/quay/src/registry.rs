//! Connection registry: token → connection + accept time.
//!
//! The registry owns every live connection and is confined to the
//! reactor thread. Each mutating entry point re-checks the running
//! thread against the owner recorded at construction; a mismatch is a
//! contract violation and panics, because connection state mutated off
//! the reactor thread is unrecoverable corruption.

use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use crate::connection::Connection;

pub(crate) struct Tracked {
    pub conn: Connection,
    pub since: SystemTime,
}

pub(crate) struct Registry {
    owner: ThreadId,
    connections: HashMap<u64, Tracked>,
}

impl Registry {
    /// Create a registry owned by the calling thread.
    pub(crate) fn new() -> Self {
        Self {
            owner: thread::current().id(),
            connections: HashMap::new(),
        }
    }

    fn check_thread(&self) {
        let current = thread::current().id();
        if current != self.owner {
            tracing::error!(
                ?current,
                owner = ?self.owner,
                "connection registry touched off the reactor thread"
            );
            panic!(
                "connection registry touched from {current:?} instead of reactor thread {:?}",
                self.owner
            );
        }
    }

    pub(crate) fn insert(&mut self, token: u64, conn: Connection) {
        self.check_thread();
        self.connections.insert(
            token,
            Tracked {
                conn,
                since: SystemTime::now(),
            },
        );
    }

    /// Remove a connection, yielding it for teardown.
    pub(crate) fn remove(&mut self, token: u64) -> Option<Connection> {
        self.check_thread();
        self.connections.remove(&token).map(|tracked| tracked.conn)
    }

    pub(crate) fn get_mut(&mut self, token: u64) -> Option<&mut Tracked> {
        self.check_thread();
        self.connections.get_mut(&token)
    }

    pub(crate) fn contains(&self, token: u64) -> bool {
        self.connections.contains_key(&token)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, &Tracked)> {
        self.connections.iter().map(|(token, tracked)| (*token, tracked))
    }

    pub(crate) fn tokens(&self) -> Vec<u64> {
        self.connections.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use std::net::{TcpListener, TcpStream};

    fn test_connection(token: u64) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _client = TcpStream::connect(addr).expect("connect");
        let (stream, peer) = listener.accept().expect("accept");
        Connection::new(stream, peer, token, 1024, 1024, 1024)
    }

    #[test]
    fn insert_lookup_remove() {
        let mut registry = Registry::new();
        registry.insert(7, test_connection(7));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(7));
        assert!(registry.get_mut(7).is_some());

        let conn = registry.remove(7).expect("connection present");
        drop(conn);
        assert_eq!(registry.len(), 0);
        assert!(registry.remove(7).is_none());
    }

    #[test]
    fn iteration_sees_all_entries() {
        let mut registry = Registry::new();
        for token in 10..20 {
            registry.insert(token, test_connection(token));
        }
        let mut tokens: Vec<u64> = registry.iter().map(|(token, _)| token).collect();
        tokens.sort_unstable();
        assert_eq!(tokens, (10..20).collect::<Vec<u64>>());
    }

    #[test]
    fn cross_thread_mutation_panics() {
        let mut registry = Registry::new();
        let result = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    registry.insert(1, test_connection(1));
                })
                .join()
        });
        let payload = result.expect_err("mutation off the reactor thread must panic");
        let message = payload.downcast_ref::<String>().expect("string panic payload");
        assert!(message.contains("reactor thread"));
    }

    #[test]
    fn rapid_connect_churn_bookkeeping() {
        // Exercise insert/remove cycles at the scale of a reconnect storm
        // without leaking registry entries.
        let mut registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        const ROUNDS: u64 = 10_000;
        const LIVE: u64 = 8;
        for round in 0..ROUNDS {
            let _client = TcpStream::connect(addr).expect("connect");
            let (stream, peer) = listener.accept().expect("accept");
            registry.insert(round, Connection::new(stream, peer, round, 1024, 1024, 1024));
            if round >= LIVE {
                let gone = registry.remove(round - LIVE).expect("old entry present");
                drop(gone);
            }
        }
        assert_eq!(registry.len(), LIVE as usize);
        for token in (ROUNDS - LIVE)..ROUNDS {
            assert!(registry.remove(token).is_some());
        }
        assert_eq!(registry.len(), 0);
    }
}
