//! Registry of live connections.
//!
//! The registry only tracks which connections are currently reachable by
//! broadcasts. It never performs I/O: callers take a [`snapshot`] and write
//! to the returned handles after the lock has been released.
//!
//! [`snapshot`]: ConnectionRegistry::snapshot

use crate::connection::{Connection, ConnectionId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    closed: bool,
}

/// Thread-safe set of live connections, keyed by connection ID.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No operation can leave the map half-updated, so a poisoned lock
        // still guards consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection.
    ///
    /// Returns `false` if a connection with the same ID was already present
    /// or the registry has been closed for shutdown.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let id = conn.id();
        let inserted = {
            let mut inner = self.lock();
            if inner.closed || inner.connections.contains_key(&id) {
                false
            } else {
                inner.connections.insert(id, conn);
                true
            }
        };
        if inserted {
            debug!(connection = %id, "Registered connection");
        }
        inserted
    }

    /// Unregister a connection. Unregistering an absent connection is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.lock().connections.remove(&id);
        if removed.is_some() {
            debug!(connection = %id, "Unregistered connection");
        }
        removed
    }

    /// Take a point-in-time copy of the registered connections, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().connections.values().cloned().collect()
    }

    /// Remove and return every registered connection, and refuse any
    /// further registrations.
    pub fn close(&self) -> Vec<Arc<Connection>> {
        let drained = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.connections)
        };
        debug!(count = drained.len(), "Closed registry");
        drained.into_values().collect()
    }

    /// Check if the registry has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    /// Get the number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }
}
