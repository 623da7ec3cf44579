//! Connection registry owned by each front-end server
//!
//! Keyed by a server-assigned [`ConnectionId`], never by remote address, so
//! several clients behind one NAT are distinct entries. The lock only guards
//! map mutation; closing sockets always happens after it is released.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::net::connection::{Connection, ConnectionId};

/// Monotonic connection id source, starting at 1
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("too many connections from {addr} (limit {limit})")]
    AddressLimit { addr: IpAddr, limit: usize },
    #[error("duplicate connection id {0}")]
    Duplicate(ConnectionId),
}

/// Concurrency-safe map of live connections
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    max_per_address: usize,
}

impl ConnectionRegistry {
    pub fn new(max_per_address: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_per_address,
        }
    }

    pub fn max_per_address(&self) -> usize {
        self.max_per_address
    }

    /// Whether another connection from `addr` would currently be accepted
    pub fn check_address(&self, addr: IpAddr) -> Result<(), RegistryError> {
        let connections = self.connections.lock();
        self.check_address_locked(&connections, addr)
    }

    fn check_address_locked(
        &self,
        connections: &HashMap<ConnectionId, Arc<Connection>>,
        addr: IpAddr,
    ) -> Result<(), RegistryError> {
        let existing = connections
            .values()
            .filter(|c| c.is_connected() && c.remote_addr().ip() == addr)
            .count();
        if existing >= self.max_per_address {
            return Err(RegistryError::AddressLimit {
                addr,
                limit: self.max_per_address,
            });
        }
        Ok(())
    }

    /// Insert a connection, enforcing the per-address cap atomically
    ///
    /// On error nothing is inserted.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let mut connections = self.connections.lock();
        if connections.contains_key(&conn.id()) {
            return Err(RegistryError::Duplicate(conn.id()));
        }
        self.check_address_locked(&connections, conn.remote_addr().ip())?;
        connections.insert(conn.id(), conn);
        Ok(())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Live connections sharing `addr`
    pub fn count_for_address(&self, addr: IpAddr) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|c| c.is_connected() && c.remote_addr().ip() == addr)
            .count()
    }

    /// Snapshot of all registered connections
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Evict every entry whose connection is no longer connected
    ///
    /// Returns the evicted ids. Sweeping a registry with nothing disconnected
    /// changes nothing.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        let mut connections = self.connections.lock();
        let dead: Vec<ConnectionId> = connections
            .iter()
            .filter(|(_, conn)| !conn.is_connected())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            connections.remove(id);
        }
        dead
    }

    /// Close connections idle for longer than `timeout`
    ///
    /// They stay registered until the next sweep.
    pub fn close_idle(&self, timeout: Duration) -> Vec<ConnectionId> {
        let idle: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .values()
            .filter(|c| c.is_connected() && c.idle_time() > timeout)
            .cloned()
            .collect();

        idle.into_iter()
            .filter(|conn| conn.close())
            .map(|conn| conn.id())
            .collect()
    }

    /// Close every registered connection; returns how many were still open
    pub fn close_all(&self) -> usize {
        self.snapshot().into_iter().filter(|conn| conn.close()).count()
    }
}
