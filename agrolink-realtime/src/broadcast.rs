//! Room fan-out for the relay.
//!
//! Every room is one tokio broadcast channel: a frame is encoded once and
//! shared by all members as `Arc<RelayFrame>`. Each member gets its own
//! receiver buffering up to `capacity` frames; slow members lag and drop
//! rather than stall the room. Filtering the sender's own frames is the
//! receiver's job (`RelayFrame::origin`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::protocol::InboundEvent;

/// One encoded frame and the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub origin: Uuid,
    pub text: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a member may fall behind before it
    /// starts dropping.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member and return its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<RelayFrame>> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode `event` once and fan it out. Returns the number of receivers,
    /// the sender's own included.
    pub fn broadcast(&self, origin: Uuid, event: &InboundEvent) -> Result<usize, ProtocolError> {
        let text = event.encode()?;
        Ok(self.broadcast_raw(Arc::new(RelayFrame { origin, text })))
    }

    /// Fan out a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<RelayFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging member skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The room refused a new member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomFull;

/// Maps room ids to broadcast groups.
///
/// Join and leave take the write lock for the whole operation so a room is
/// never removed while someone is joining it.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add `peer_id` to `room`, creating the room on first join.
    pub async fn join(
        &self,
        room: &str,
        peer_id: Uuid,
        max_peers: usize,
    ) -> Result<(Arc<BroadcastGroup>, broadcast::Receiver<Arc<RelayFrame>>), RoomFull> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();

        if !group.has_peer(&peer_id).await && group.peer_count().await >= max_peers {
            if group.peer_count().await == 0 {
                rooms.remove(room);
            }
            return Err(RoomFull);
        }
        let rx = group.add_peer(peer_id).await;
        Ok((group, rx))
    }

    /// Remove `peer_id` from `room`; the room goes away once empty.
    pub async fn leave(&self, room: &str, peer_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room).cloned() else {
            return false;
        };
        let removed = group.remove_peer(peer_id).await;
        if group.peer_count().await == 0 {
            rooms.remove(room);
            log::info!("Room {room} removed (empty)");
        }
        removed
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Active room ids, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        rooms.sort();
        rooms
    }
}
