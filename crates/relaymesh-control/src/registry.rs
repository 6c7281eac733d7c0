//! Registry of the upstream connections held by this node

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::connection::{Conn, ConnId};

/// Receives connections as they come and go
pub trait ConnectionManager: Send + Sync {
    fn add_conn(&self, conn: Arc<dyn Conn>);

    fn remove_conn(&self, conn: &Arc<dyn Conn>);
}

type EndpointConns = HashMap<ConnId, Arc<dyn Conn>>;

/// Endpoint ID -> connections serving it
///
/// Every connection lives under its own endpoint ID, and an endpoint with no
/// connections has no entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    endpoints: Mutex<HashMap<String, EndpointConns>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EndpointConns>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection under its endpoint ID.
    ///
    /// Returns the number of connections the endpoint has afterwards.
    pub fn add(&self, conn: Arc<dyn Conn>) -> usize {
        let mut endpoints = self.lock();
        let conns = endpoints.entry(conn.endpoint_id().to_string()).or_default();
        conns.insert(conn.id(), conn);
        conns.len()
    }

    /// Unregister a connection.
    ///
    /// Returns the number of connections the endpoint has left, or `None` if
    /// the connection was not registered.
    pub fn remove(&self, conn: &dyn Conn) -> Option<usize> {
        let mut endpoints = self.lock();
        let conns = endpoints.get_mut(conn.endpoint_id())?;
        conns.remove(&conn.id())?;

        let remaining = conns.len();
        if remaining == 0 {
            endpoints.remove(conn.endpoint_id());
        }
        Some(remaining)
    }

    /// Snapshot of the connections serving `endpoint_id`
    pub fn lookup(&self, endpoint_id: &str) -> Vec<Arc<dyn Conn>> {
        self.lock()
            .get(endpoint_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Connection count per endpoint
    pub fn endpoints(&self) -> HashMap<String, usize> {
        self.lock()
            .iter()
            .map(|(id, conns)| (id.clone(), conns.len()))
            .collect()
    }

    /// Total number of registered connections
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl ConnectionManager for ConnectionRegistry {
    fn add_conn(&self, conn: Arc<dyn Conn>) {
        let id = conn.id();
        let endpoint_id = conn.endpoint_id().to_string();
        let count = self.add(conn);
        info!(
            "Connection {} registered for endpoint {} ({} active)",
            id, endpoint_id, count
        );
    }

    fn remove_conn(&self, conn: &Arc<dyn Conn>) {
        match self.remove(conn.as_ref()) {
            Some(remaining) => info!(
                "Connection {} removed from endpoint {} ({} active)",
                conn.id(),
                conn.endpoint_id(),
                remaining
            ),
            None => debug!("Connection {} already removed", conn.id()),
        }
    }
}

/// Keeps a connection registered for as long as it is held.
///
/// Dropping it unregisters the connection and closes its transport, exactly
/// once, however the owning task ends.
pub struct Registration {
    manager: Arc<dyn ConnectionManager>,
    conn: Arc<dyn Conn>,
}

impl Registration {
    pub fn new(manager: Arc<dyn ConnectionManager>, conn: Arc<dyn Conn>) -> Self {
        manager.add_conn(conn.clone());
        Self { manager, conn }
    }

    pub fn conn(&self) -> &Arc<dyn Conn> {
        &self.conn
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.manager.remove_conn(&self.conn);
        self.conn.close();
    }
}
