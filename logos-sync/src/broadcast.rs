//! Fan-out of relay pushes to every session on a board.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each session gets an independent receiver that buffers up to `capacity`
//! messages. Frames are encoded once and shared as `Arc<Vec<u8>>`.
//!
//! Whether the originating session also receives a message is decided per
//! message (`echo`): confirmed batches go back to their sender so it can
//! adopt server timestamps, element operations do not.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{self, Frame, ProtocolError, Topic};

/// One pre-encoded push for a board.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    /// Session that caused the message (`Uuid::nil()` for the relay itself)
    pub origin: Uuid,
    /// Deliver to `origin` as well
    pub echo: bool,
    /// Encoded [`Frame::Push`]
    pub frame: Arc<Vec<u8>>,
}

impl RoomMessage {
    pub fn delivers_to(&self, session_id: &Uuid) -> bool {
        self.echo || self.origin != *session_id
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, read via `stats()`.
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

/// A broadcast group for a single board.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomMessage>,
    peers: Arc<RwLock<HashSet<Uuid>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a session; returns its receiver.
    pub async fn add_peer(&self, session_id: Uuid) -> broadcast::Receiver<RoomMessage> {
        self.peers.write().await.insert(session_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session_id: &Uuid) -> bool {
        self.peers.write().await.remove(session_id)
    }

    /// Encode `body` as a push on `topic` and fan it out.
    ///
    /// Returns the number of receivers.
    pub fn broadcast<T: Serialize>(
        &self,
        origin: Uuid,
        echo: bool,
        topic: Topic,
        body: &T,
    ) -> Result<usize, ProtocolError> {
        let payload = protocol::encode(body)?;
        let frame = Frame::Push { topic, payload }.encode()?;
        Ok(self.broadcast_raw(RoomMessage {
            origin,
            echo,
            frame: Arc::new(frame),
        }))
    }

    /// Fan out an already encoded message.
    pub fn broadcast_raw(&self, message: RoomMessage) -> usize {
        let count = self.sender.send(message).unwrap_or(0);
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

    pub async fn peers(&self) -> Vec<Uuid> {
        self.peers.read().await.iter().copied().collect()
    }

    pub async fn has_peer(&self, session_id: &Uuid) -> bool {
        self.peers.read().await.contains(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps board ids to broadcast groups.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for `channel_id`.
    pub async fn get_or_create(&self, channel_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().await.get(channel_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, channel_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(channel_id).cloned()
    }

    /// Remove a room nobody is in.
    pub async fn remove_if_empty(&self, channel_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(channel_id) {
            if room.peer_count().await == 0 {
                rooms.remove(channel_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Watermark;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let session = Uuid::new_v4();

        let _rx = group.add_peer(session).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&session).await);

        assert!(group.remove_peer(&session).await);
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.remove_peer(&session).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let mut rx1 = group.add_peer(alice).await;
        let mut rx2 = group.add_peer(Uuid::new_v4()).await;

        let count = group
            .broadcast(alice, false, Topic::Watermark, &Watermark { latest_timestamp: 4.0 })
            .unwrap();
        // Every receiver gets it; echo filtering is the receiver's job
        assert_eq!(count, 2);

        let message = rx1.recv().await.unwrap();
        assert!(!message.delivers_to(&alice));
        let message = rx2.recv().await.unwrap();
        match Frame::decode(&message.frame).unwrap() {
            Frame::Push { topic, payload } => {
                assert_eq!(topic, Topic::Watermark);
                let watermark: Watermark = protocol::decode(&payload).unwrap();
                assert_eq!(watermark.latest_timestamp, 4.0);
            }
            other => panic!("Expected push, got {other:?}"),
        }
    }

    #[test]
    fn test_echo_delivery() {
        let origin = Uuid::new_v4();
        let echoed = RoomMessage {
            origin,
            echo: true,
            frame: Arc::new(Vec::new()),
        };
        assert!(echoed.delivers_to(&origin));

        let forwarded = RoomMessage {
            echo: false,
            ..echoed
        };
        assert!(!forwarded.delivers_to(&origin));
        assert!(forwarded.delivers_to(&Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_peer(Uuid::new_v4()).await;
        group.broadcast_raw(RoomMessage {
            origin: Uuid::nil(),
            echo: true,
            frame: Arc::new(vec![1]),
        });
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let room1 = manager.get_or_create("board").await;
        let room2 = manager.get_or_create("board").await;
        assert!(Arc::ptr_eq(&room1, &room2));

        let _other = manager.get_or_create("other").await;
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.active_channels().await.contains(&"other".to_string()));
        assert!(manager.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create("board").await;
        let session = Uuid::new_v4();
        let _rx = room.add_peer(session).await;

        assert!(!manager.remove_if_empty("board").await);
        room.remove_peer(&session).await;
        assert!(manager.remove_if_empty("board").await);
        assert_eq!(manager.room_count().await, 0);
    }
}
