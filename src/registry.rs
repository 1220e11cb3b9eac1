//! Connection reuse directory
//!
//! A [`ConnectionRegistry`] maps `host:port` keys onto shared engines so
//! callers can reuse an open connection instead of dialing a new one. It is
//! an explicitly constructed value passed to the call sites that need it -
//! never process-wide state - and the map is mutex-guarded because lookups
//! and insertions race across connections being opened concurrently to the
//! same host.
//!
//! The registry never reaches into the engine: when a connection reports
//! [`crate::H2Event::GoAway`] or a connection error, the owner calls
//! [`ConnectionRegistry::remove`] for its key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::H2Connection;

/// Shared handle to a registered engine. The inner mutex serializes all
/// engine access onto one logical thread of control at a time.
pub type SharedConnection = Arc<Mutex<H2Connection>>;

/// Directory of open connections keyed by `host:port`.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, SharedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Canonical key for an endpoint.
    pub fn connection_key(host: &str, port: u16) -> String {
        format!("{}:{}", host.to_ascii_lowercase(), port)
    }

    /// Look up an existing connection.
    pub fn get(&self, key: &str) -> Option<SharedConnection> {
        self.connections.lock().unwrap().get(key).cloned()
    }

    /// Register a connection under `key`, replacing any previous entry.
    pub fn insert(&self, key: impl Into<String>, conn: SharedConnection) {
        self.connections.lock().unwrap().insert(key.into(), conn);
    }

    /// Return the connection for `key`, creating and registering one with
    /// `make` if absent. The lock is held across creation so two callers
    /// racing on the same key end up sharing one engine.
    pub fn get_or_create(
        &self,
        key: &str,
        make: impl FnOnce() -> H2Connection,
    ) -> SharedConnection {
        let mut map = self.connections.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(make())))
            .clone()
    }

    /// Drop the entry for `key` (connection failed or went away).
    pub fn remove(&self, key: &str) -> Option<SharedConnection> {
        self.connections.lock().unwrap().remove(key)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().unwrap().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
