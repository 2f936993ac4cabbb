//! Connection management module
//!
//! Tracks the in-flight connections of one server instance and provides
//! kick-off capability.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Unique connection identifier
pub type ConnectionId = u64;

/// Active connection handle with cancellation support
#[derive(Debug)]
struct ActiveConnection {
    peer_addr: String,
    connected_at: Instant,
    cancel_token: CancellationToken,
}

/// Registry of active connections with kick-off capability
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    /// Counter for generating unique connection IDs
    next_conn_id: Arc<AtomicU64>,
    /// Map from connection_id to active connection
    connections: Arc<DashMap<ConnectionId, ActiveConnection>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            next_conn_id: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a new connection and return its ID and cancellation token
    pub fn register(&self, peer_addr: String) -> (ConnectionId, CancellationToken) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();

        self.connections.insert(
            conn_id,
            ActiveConnection {
                peer_addr,
                connected_at: Instant::now(),
                cancel_token: cancel_token.clone(),
            },
        );

        (conn_id, cancel_token)
    }

    /// Unregister a connection
    pub fn unregister(&self, conn_id: ConnectionId) {
        self.connections.remove(&conn_id);
    }

    /// Cancel every registered connection, returns how many were signalled
    pub fn kick_all(&self) -> usize {
        let mut kicked = 0;
        for conn in self.connections.iter() {
            log::debug!(
                conn_id = *conn.key(),
                peer = %conn.peer_addr,
                age = ?conn.connected_at.elapsed(),
                "Kicking connection"
            );
            conn.cancel_token.cancel();
            kicked += 1;
        }
        kicked
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Age of the longest-lived active connection
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.connections
            .iter()
            .map(|c| c.connected_at.elapsed())
            .max()
    }
}
