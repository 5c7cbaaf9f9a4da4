//! Connection registry
//!
//! Maps peer identity to the single live [`PeerConnection`] for that peer.
//! The registry is shared by the establishment dispatcher, the per-peer read
//! loops, outgoing senders and the health monitor, so every operation takes
//! one internal lock and completes under it: nobody can observe a
//! half-inserted or half-removed entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::connection::{PeerConnection, PeerRef};
use crate::health::evaluate;
use crate::identity::{short_id, Role};

/// Default maximum number of simultaneous peer connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

// ============================================================================
// Registry Structure
// ============================================================================

/// Capacity-bounded map from peer identity to live connection
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<PeerConnection>>>,
    capacity: usize,
    /// Idle window after which a connection counts as unhealthy in stats
    idle_threshold: Duration,
}

/// Aggregate view of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub responders: usize,
    pub initiators: usize,
    pub unhealthy: usize,
    pub average_age: Duration,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize, idle_threshold: Duration) -> Self {
        ConnectionRegistry {
            connections: Mutex::new(HashMap::new()),
            capacity,
            idle_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<PeerConnection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a connection
    ///
    /// Fails without touching state when the registry is full or the peer
    /// already has a live connection.
    pub fn add(&self, peer_id: &str, conn: Arc<PeerConnection>) -> bool {
        let mut connections = self.lock();

        if connections.contains_key(peer_id) {
            log::warn!(
                "Connection for {} already registered, rejecting duplicate",
                short_id(peer_id)
            );
            return false;
        }

        if connections.len() >= self.capacity {
            log::warn!("Maximum connections reached ({})", self.capacity);
            return false;
        }

        connections.insert(peer_id.to_string(), conn);
        log::debug!(
            "Connection added: {} (total: {})",
            short_id(peer_id),
            connections.len()
        );
        true
    }

    /// Remove and return the connection for `peer_id`
    pub fn remove(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        let mut connections = self.lock();
        let removed = connections.remove(peer_id);
        if removed.is_some() {
            log::debug!(
                "Connection removed: {} (remaining: {})",
                short_id(peer_id),
                connections.len()
            );
        }
        removed
    }

    /// Remove `conn` only if it is still the registered connection for its peer
    ///
    /// A read loop that outlived its connection must not evict the newer
    /// connection that replaced it.
    pub fn remove_if_current(&self, conn: &Arc<PeerConnection>) -> bool {
        let mut connections = self.lock();
        let is_current = connections
            .get(conn.peer_id())
            .map(|registered| Arc::ptr_eq(registered, conn))
            .unwrap_or(false);

        if is_current {
            connections.remove(conn.peer_id());
            log::debug!(
                "Connection evicted: {} (remaining: {})",
                short_id(conn.peer_id()),
                connections.len()
            );
        }
        is_current
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.lock().get(peer_id).cloned()
    }

    pub fn find_by_peer_ref(&self, peer_ref: &PeerRef) -> Option<Arc<PeerConnection>> {
        self.lock()
            .values()
            .find(|c| c.peer_ref() == peer_ref)
            .cloned()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.lock().contains_key(peer_id)
    }

    /// Snapshot of every registered connection
    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        self.lock().values().cloned().collect()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drain every connection (used at shutdown)
    pub fn clear(&self) -> Vec<Arc<PeerConnection>> {
        let drained: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            log::debug!("All connections cleared ({})", drained.len());
        }
        drained
    }

    pub fn statistics(&self) -> RegistryStats {
        let connections = self.lock();
        let total = connections.len();
        let responders = connections
            .values()
            .filter(|c| c.role() == Role::Responder)
            .count();
        let initiators = connections
            .values()
            .filter(|c| c.role() == Role::Initiator)
            .count();
        let unhealthy = connections
            .values()
            .filter(|c| !evaluate(c, self.idle_threshold).is_healthy())
            .count();
        let average_age = if total == 0 {
            Duration::ZERO
        } else {
            let sum: Duration = connections.values().map(|c| c.age()).sum();
            sum / total as u32
        };

        RegistryStats {
            total,
            responders,
            initiators,
            unhealthy,
            average_age,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS, Duration::from_secs(60))
    }
}
