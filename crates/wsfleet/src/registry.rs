//! Per-worker registry of open WebSocket connections.
//!
//! The registry is owned by a worker's event loop and never shared, so it is a
//! plain map without interior locking.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::DateTime;
use chrono::Utc;

use crate::ids::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub opened_at: DateTime<Utc>,
    pub peer: Option<SocketAddr>,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            opened_at: Utc::now(),
            peer,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection opened just now with no known peer.
    pub fn add(&mut self, id: ConnectionId) {
        self.insert(ConnectionRecord::new(id, None));
    }

    /// Registers `record`. An id that is already present keeps its original
    /// record; returns whether the record was stored.
    pub fn insert(&mut self, record: ConnectionRecord) -> bool {
        if self.connections.contains_key(&record.id) {
            return false;
        }
        self.connections.insert(record.id, record);
        true
    }

    /// Forgets `id`. Unknown ids are ignored.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(&id)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
