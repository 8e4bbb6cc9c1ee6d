//! Append-only log of chat messages.
//!
//! Inbound messages are appended in transport delivery order. Nothing is
//! reordered or deduplicated: delivery is at-least-once and possibly out of
//! order across reconnects, so consumers must tolerate duplicates.

use crate::protocol::{ChatMessage, MessageId};

#[derive(Debug, Default, Clone)]
pub struct MessageStream {
    entries: Vec<ChatMessage>,
}

impl MessageStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(message);
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    /// Messages of one chat session, in arrival order.
    pub fn for_session<'a>(&'a self, session_id: &'a str) -> impl Iterator<Item = &'a ChatMessage> + 'a {
        self.entries.iter().filter(move |m| m.session_id == session_id)
    }

    /// Number of entries carrying `id` (more than one means redelivery).
    pub fn count_id(&self, id: &MessageId) -> usize {
        self.entries
            .iter()
            .filter(|m| m.id.as_ref() == Some(id))
            .count()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty the local log. Server-side history is untouched.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop one session's entries. Returns how many were removed.
    pub fn clear_session(&mut self, session_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|m| m.session_id != session_id);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SenderRole;

    fn msg(session: &str, content: &str, id: u64) -> ChatMessage {
        let mut m = ChatMessage::new(session, content, SenderRole::Assistant);
        m.id = Some(MessageId::Number(id));
        m
    }

    #[test]
    fn test_append_preserves_arrival_order() {
        let mut stream = MessageStream::new();
        stream.push(msg("a", "second", 2));
        stream.push(msg("a", "first", 1));

        let contents: Vec<&str> = stream.entries().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "first"]);
        assert_eq!(stream.last().unwrap().content, "first");
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut stream = MessageStream::new();
        stream.push(msg("a", "hi", 1));
        stream.push(msg("a", "hi", 1));
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.count_id(&MessageId::Number(1)), 2);
    }

    #[test]
    fn test_for_session_and_clear_session() {
        let mut stream = MessageStream::new();
        stream.push(msg("a", "1", 1));
        stream.push(msg("b", "2", 2));
        stream.push(msg("a", "3", 3));

        assert_eq!(stream.for_session("a").count(), 2);
        assert_eq!(stream.clear_session("a"), 2);
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.entries()[0].session_id, "b");
    }

    #[test]
    fn test_clear() {
        let mut stream = MessageStream::new();
        stream.push(msg("a", "1", 1));
        stream.clear();
        assert!(stream.is_empty());
    }
}
