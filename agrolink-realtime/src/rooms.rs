//! Room membership tracking.
//!
//! Membership is kept in two phases so both can be observed independently:
//!
//! - **intent**: rooms the local user asked to be in. Updated immediately
//!   (optimistic) by `join`/`leave`.
//! - **confirmed**: rooms the server acknowledged with `room_joined`.
//!
//! A third set, **sent**, records which joins went out during the current
//! connection lifetime. Joins requested while offline stay in intent without
//! being sent and are replayed by [`RoomTracker::pending_joins`] once the
//! connection is up.

use std::collections::HashSet;

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// `join_room` was transmitted.
    Sent,
    /// Not connected; the join is replayed on `connected`.
    Queued,
    /// Already in the room; nothing sent.
    AlreadyJoined,
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveStatus {
    /// `leave_room` was transmitted.
    Sent,
    /// The join was still queued and has been discarded.
    Dequeued,
    /// Not in the room; nothing sent.
    NotJoined,
}

/// What the caller must do after [`RoomTracker::request_leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveAction {
    /// The join was transmitted in this connection lifetime; send `leave_room`.
    Transmit,
    /// The join never went out; nothing to send.
    Dequeue,
    NotJoined,
}

#[derive(Debug, Default, Clone)]
pub struct RoomTracker {
    intent: HashSet<String>,
    sent: HashSet<String>,
    confirmed: HashSet<String>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the intent to join. Returns `false` if already joined.
    pub fn request_join(&mut self, room: &str) -> bool {
        self.intent.insert(room.to_string())
    }

    /// Mark a join as transmitted on the current connection.
    pub fn mark_sent(&mut self, room: &str) {
        if self.intent.contains(room) {
            self.sent.insert(room.to_string());
        }
    }

    /// Drop the room locally and report whether a leave must be transmitted.
    pub fn request_leave(&mut self, room: &str) -> LeaveAction {
        if !self.intent.remove(room) {
            return LeaveAction::NotJoined;
        }
        self.confirmed.remove(room);
        if self.sent.remove(room) {
            LeaveAction::Transmit
        } else {
            LeaveAction::Dequeue
        }
    }

    /// Joins that still have to go out on this connection, marked as sent.
    ///
    /// Sorted so replay order is deterministic.
    pub fn pending_joins(&mut self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .intent
            .iter()
            .filter(|room| !self.sent.contains(*room))
            .cloned()
            .collect();
        pending.sort();
        self.sent.extend(pending.iter().cloned());
        pending
    }

    /// Server acknowledged a join. Ignored if the user left in the meantime.
    pub fn confirm_joined(&mut self, room: &str) -> bool {
        if self.intent.contains(room) {
            self.confirmed.insert(room.to_string())
        } else {
            false
        }
    }

    /// Server acknowledged a leave (or dropped us from the room).
    pub fn confirm_left(&mut self, room: &str) -> bool {
        self.confirmed.remove(room)
    }

    /// The transport dropped: the server forgot our rooms, but the intent stands.
    pub fn on_transport_drop(&mut self) {
        self.sent.clear();
        self.confirmed.clear();
    }

    /// Forget everything (explicit disconnect). No leave requests are produced.
    pub fn clear(&mut self) -> usize {
        let released = self.intent.len();
        self.intent.clear();
        self.sent.clear();
        self.confirmed.clear();
        released
    }

    pub fn is_joined(&self, room: &str) -> bool {
        self.intent.contains(room)
    }

    pub fn is_confirmed(&self, room: &str) -> bool {
        self.confirmed.contains(room)
    }

    pub fn is_queued(&self, room: &str) -> bool {
        self.intent.contains(room) && !self.sent.contains(room)
    }

    /// Joined rooms, sorted.
    pub fn joined(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.intent.iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Confirmed rooms, sorted.
    pub fn confirmed(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.confirmed.iter().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn len(&self) -> usize {
        self.intent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_idempotent() {
        let mut rooms = RoomTracker::new();
        assert!(rooms.request_join("room-7"));
        rooms.mark_sent("room-7");
        assert!(!rooms.request_join("room-7"));
        assert_eq!(rooms.len(), 1);
        assert!(rooms.pending_joins().is_empty());
    }

    #[test]
    fn test_leave_when_not_joined() {
        let mut rooms = RoomTracker::new();
        assert_eq!(rooms.request_leave("room-7"), LeaveAction::NotJoined);
    }

    #[test]
    fn test_leave_sent_join_transmits() {
        let mut rooms = RoomTracker::new();
        rooms.request_join("room-7");
        rooms.mark_sent("room-7");
        rooms.confirm_joined("room-7");

        assert_eq!(rooms.request_leave("room-7"), LeaveAction::Transmit);
        assert!(!rooms.is_joined("room-7"));
        assert!(!rooms.is_confirmed("room-7"));
    }

    #[test]
    fn test_leave_queued_join_dequeues() {
        let mut rooms = RoomTracker::new();
        rooms.request_join("room-7");
        assert!(rooms.is_queued("room-7"));

        assert_eq!(rooms.request_leave("room-7"), LeaveAction::Dequeue);
        assert!(rooms.pending_joins().is_empty());
    }

    #[test]
    fn test_pending_joins_replayed_once() {
        let mut rooms = RoomTracker::new();
        rooms.request_join("b");
        rooms.request_join("a");

        assert_eq!(rooms.pending_joins(), vec!["a".to_string(), "b".to_string()]);
        assert!(rooms.pending_joins().is_empty());
        assert!(!rooms.is_queued("a"));
    }

    #[test]
    fn test_confirmation_is_separate_from_intent() {
        let mut rooms = RoomTracker::new();
        rooms.request_join("room-7");
        rooms.mark_sent("room-7");
        assert!(rooms.is_joined("room-7"));
        assert!(!rooms.is_confirmed("room-7"));

        assert!(rooms.confirm_joined("room-7"));
        assert!(rooms.is_confirmed("room-7"));

        assert!(rooms.confirm_left("room-7"));
        assert!(rooms.is_joined("room-7"));
        assert!(!rooms.is_confirmed("room-7"));
    }

    #[test]
    fn test_late_confirmation_after_leave_ignored() {
        let mut rooms = RoomTracker::new();
        rooms.request_join("room-7");
        rooms.mark_sent("room-7");
        rooms.request_leave("room-7");

        assert!(!rooms.confirm_joined("room-7"));
        assert!(rooms.confirmed().is_empty());
    }

    #[test]
    fn test_transport_drop_requeues_intent() {
        let mut rooms = RoomTracker::new();
        rooms.request_join("a");
        rooms.request_join("b");
        rooms.pending_joins();
        rooms.confirm_joined("a");

        rooms.on_transport_drop();
        assert_eq!(rooms.joined(), vec!["a".to_string(), "b".to_string()]);
        assert!(rooms.confirmed().is_empty());
        assert_eq!(rooms.pending_joins().len(), 2);
    }

    #[test]
    fn test_clear_releases_all_rooms() {
        let mut rooms = RoomTracker::new();
        for room in ["a", "b", "c"] {
            rooms.request_join(room);
            rooms.mark_sent(room);
        }
        assert_eq!(rooms.clear(), 3);
        assert!(rooms.is_empty());
        assert!(rooms.pending_joins().is_empty());
    }

    #[test]
    fn test_mark_sent_requires_intent() {
        let mut rooms = RoomTracker::new();
        rooms.mark_sent("ghost");
        rooms.request_join("ghost");
        assert!(rooms.is_queued("ghost"));
    }
}
