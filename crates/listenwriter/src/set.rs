//! The live connection set shared by the acceptor, the broadcaster and shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionId};
use crate::metrics;

struct Members {
    conns: HashMap<ConnectionId, Arc<Connection>>,
    /// Set once by `drain_and_seal`; no inserts are accepted afterwards.
    sealed: bool,
}

/// Connections that receive the next broadcast.
///
/// Every structural change happens under one lock. Traversal works on a
/// snapshot so writes never hold the lock while waiting on a client.
pub struct ConnectionSet {
    members: RwLock<Members>,
}

impl ConnectionSet {
    /// Create an empty, open set.
    pub fn new() -> Self {
        Self {
            members: RwLock::new(Members {
                conns: HashMap::new(),
                sealed: false,
            }),
        }
    }

    /// Admit a connection. A sealed set hands the connection back.
    pub async fn insert(&self, connection: Arc<Connection>) -> Result<(), Arc<Connection>> {
        let mut members = self.members.write().await;
        if members.sealed {
            return Err(connection);
        }
        let _ = members.conns.insert(connection.id().clone(), connection);
        metrics::set_active_connections(members.conns.len());
        Ok(())
    }

    /// Remove a connection by ID, returning it if it was a member.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut members = self.members.write().await;
        let removed = members.conns.remove(id);
        if removed.is_some() {
            metrics::set_active_connections(members.conns.len());
        }
        removed
    }

    /// Current members, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.members.read().await.conns.values().cloned().collect()
    }

    /// Take every member and refuse all future inserts.
    pub async fn drain_and_seal(&self) -> Vec<Arc<Connection>> {
        let mut members = self.members.write().await;
        members.sealed = true;
        metrics::set_active_connections(0);
        members.conns.drain().map(|(_, conn)| conn).collect()
    }

    /// Number of members.
    pub async fn len(&self) -> usize {
        self.members.read().await.conns.len()
    }

    /// Whether the set has no members.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `drain_and_seal` has run.
    pub async fn is_sealed(&self) -> bool {
        self.members.read().await.sealed
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}
