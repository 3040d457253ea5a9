//! Per-project fan-out on the relay.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` messages; a receiver that falls further behind lags and
//! must be resynchronized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage, UserIdentity};

/// A connection admitted to a project room.
///
/// A reconnecting client briefly has two connections, so peers are keyed by
/// `connection_id` rather than `client_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPeer {
    pub connection_id: Uuid,
    pub client_id: Uuid,
    pub identity: UserIdentity,
    pub joined_at: SystemTime,
}

impl RelayPeer {
    pub fn new(client_id: Uuid, identity: UserIdentity) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            client_id,
            identity,
            joined_at: SystemTime::now(),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Stats are tracked via atomics so the send path never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Broadcast group for a single project room.
///
/// Every message is delivered to all receivers, the sender included;
/// connections filter out their own messages by `client_id`.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: Arc<RwLock<HashMap<Uuid, RelayPeer>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, peer: RelayPeer) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer.connection_id, peer);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<RelayPeer> {
        let mut peers = self.peers.write().await;
        peers.remove(connection_id)
    }

    /// Encode once and fan out. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<RelayPeer> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Whether any connection of `client_id` is still in the room.
    pub async fn has_peer(&self, client_id: &Uuid) -> bool {
        self.peers
            .read()
            .await
            .values()
            .any(|p| p.client_id == *client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> RelayPeer {
        RelayPeer::new(
            Uuid::new_v4(),
            UserIdentity::new(name.to_lowercase(), name, format!("{name}@example.com")),
        )
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let client_id = alice.client_id;
        let connection_id = alice.connection_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&client_id).await);

        let removed = group.remove_peer(&connection_id).await.unwrap();
        assert_eq!(removed.identity.display_name, "Alice");
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&client_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");

        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(peer("Bob")).await;
        let mut rx3 = group.add_peer(peer("Charlie")).await;

        let msg = SyncMessage::update(alice.client_id, "p1", 1, vec![1, 2, 3]);
        let count = group.broadcast(&msg).unwrap();

        // Sender included; filtering is the connection's job.
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let bytes = rx.recv().await.unwrap();
            let decoded = SyncMessage::decode(&bytes).unwrap();
            assert_eq!(decoded.client_id, alice.client_id);
            assert_eq!(decoded.payload, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(16);
        assert_eq!(group.broadcast_raw(Arc::new(vec![1])), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(peer("Slow")).await;

        for i in 0..5u8 {
            group.broadcast_raw(Arc::new(vec![i]));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                group.record_dropped(skipped);
                assert_eq!(skipped, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(*rx.recv().await.unwrap(), vec![3]);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);

        let _rx1 = group.add_peer(peer("Alice")).await;
        let _rx2 = group.add_peer(peer("Bob")).await;

        let names: Vec<String> = group
            .peers()
            .await
            .into_iter()
            .map(|p| p.identity.display_name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Alice".to_string()));
        assert!(names.contains(&"Bob".to_string()));
    }

    #[tokio::test]
    async fn test_reconnect_overlap_keeps_new_connection() {
        let group = BroadcastGroup::new(8);
        let old = peer("Alice");
        let new = RelayPeer::new(old.client_id, old.identity.clone());

        let _rx_old = group.add_peer(old.clone()).await;
        let _rx_new = group.add_peer(new.clone()).await;
        assert_eq!(group.peer_count().await, 2);

        group.remove_peer(&old.connection_id).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&old.client_id).await);
    }
}
