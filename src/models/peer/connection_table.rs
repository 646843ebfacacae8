use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;

use super::ConnectionDirection;
use super::PeerConnection;
use super::PeerId;

/// A canonical link younger than this is kept over a competing
/// non-canonical one. Older links are replaced by any newcomer, since a
/// half-open link to a restarted peer would otherwise never give way.
pub const SIMULTANEOUS_DIAL_WINDOW: Duration = Duration::from_secs(5);

/// Outcome of offering a freshly handshaken connection to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// No previous entry existed.
    Inserted,
    /// A previous entry existed and was closed.
    Replaced,
    /// The existing canonical link was kept; the offered one was closed.
    Refused,
}

/// Single source of truth for "which peers am I connected to".
///
/// All mutations are serialized by one write lock. Connections are closed
/// only after the lock is released, so no lock is held across network I/O.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    tie_break_window: Duration,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::with_tie_break_window(SIMULTANEOUS_DIAL_WINDOW)
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tie_break_window(tie_break_window: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            tie_break_window,
        }
    }

    /// Insert or replace the entry for the connection's identity. A replaced
    /// connection is closed before this returns.
    pub async fn upsert(&self, connection: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        let previous = self
            .connections
            .write()
            .await
            .insert(connection.peer_id().clone(), connection.clone());

        match previous {
            Some(previous) if previous.id() != connection.id() => {
                info!(
                    "Replacing connection {} to {} with connection {}",
                    previous.id(),
                    previous.peer_id(),
                    connection.id()
                );
                previous.close().await;
                Some(previous)
            }
            _ => None,
        }
    }

    /// Like [`Self::upsert`], but keeps an existing live link if it is the
    /// canonical one, the offered link is not, and the existing link is
    /// still within the tie-break window. See
    /// [`ConnectionDirection::is_canonical`].
    pub async fn admit(&self, connection: Arc<PeerConnection>, own_id: &PeerId) -> Admission {
        let previous = {
            let mut connections = self.connections.write().await;
            let keep_existing = connections
                .get(connection.peer_id())
                .is_some_and(|existing| {
                    self.keeps_existing(existing, connection.direction(), own_id)
                });
            if keep_existing {
                None
            } else {
                Some(connections.insert(connection.peer_id().clone(), connection.clone()))
            }
        };

        match previous {
            None => {
                info!(
                    "Keeping canonical connection to {}; refusing connection {}",
                    connection.peer_id(),
                    connection.id()
                );
                connection.close().await;
                Admission::Refused
            }
            Some(None) => Admission::Inserted,
            Some(Some(previous)) => {
                debug!(
                    "Connection {} to {} superseded by {}",
                    previous.id(),
                    previous.peer_id(),
                    connection.id()
                );
                previous.close().await;
                Admission::Replaced
            }
        }
    }

    /// Whether a new link to `peer_id` in `direction` would be admitted right
    /// now. Advisory only; [`Self::admit`] re-checks under the write lock.
    pub async fn would_admit(
        &self,
        peer_id: &PeerId,
        direction: ConnectionDirection,
        own_id: &PeerId,
    ) -> bool {
        match self.connections.read().await.get(peer_id) {
            Some(existing) => !self.keeps_existing(existing, direction, own_id),
            None => true,
        }
    }

    fn keeps_existing(
        &self,
        existing: &PeerConnection,
        offered: ConnectionDirection,
        own_id: &PeerId,
    ) -> bool {
        let remote_id = existing.peer_id();
        existing.is_live()
            && existing.age() < self.tie_break_window
            && existing.direction().is_canonical(own_id, remote_id)
            && !offered.is_canonical(own_id, remote_id)
    }

    /// Remove and close the entry for `peer_id`. Removing an absent identity
    /// is a no-op.
    pub async fn remove(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        let removed = self.connections.write().await.remove(peer_id);
        if let Some(connection) = &removed {
            connection.close().await;
        }
        removed
    }

    /// Remove the entry for `connection`'s identity only if the entry still
    /// refers to this very connection, then close it. Used by a terminating
    /// peer loop so a superseded link never evicts its successor.
    pub async fn remove_connection(&self, connection: &PeerConnection) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            let is_current = connections
                .get(connection.peer_id())
                .is_some_and(|current| current.id() == connection.id());
            if is_current {
                connections.remove(connection.peer_id())
            } else {
                None
            }
        };
        connection.close().await;
        removed.is_some()
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.connections.read().await.get(peer_id).cloned()
    }

    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.connections.read().await.contains_key(peer_id)
    }

    /// Snapshot of the connected identities, sorted.
    pub async fn list(&self) -> Vec<PeerId> {
        let mut peer_ids: Vec<PeerId> = self.connections.read().await.keys().cloned().collect();
        peer_ids.sort();
        peer_ids
    }

    /// Snapshot of the connections themselves. Entries may be removed or
    /// closed concurrently after this returns.
    pub async fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Remove and close every entry. Returns how many were removed.
    pub async fn drain(&self) -> usize {
        let drained: Vec<Arc<PeerConnection>> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        let count = drained.len();
        futures::future::join_all(drained.iter().map(|connection| connection.close())).await;
        count
    }
}
