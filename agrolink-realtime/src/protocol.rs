//! JSON wire protocol for the realtime channel.
//!
//! Every frame is a text frame carrying one event envelope:
//! ```text
//! { "event": "send_message", "data": { "sessionId": "room-7", "content": "hi", ... } }
//! ```
//!
//! The event set is closed: [`OutboundEvent`] for client → server and
//! [`InboundEvent`] for server → client. Unknown event names fail to decode
//! instead of being routed by string lookup.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;

/// Current time in millis since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Payload naming a single room: `{ "sessionId": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub session_id: String,
}

impl RoomRef {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into() }
    }
}

/// Message identifier as assigned by the server (numeric or opaque string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(u64),
    Text(String),
}

/// Message timestamp; the backend sends either epoch millis or an ISO string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(u64),
    Text(String),
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    #[default]
    User,
    Assistant,
    Expert,
    System,
    #[serde(other)]
    Other,
}

/// A chat message as delivered by the server.
///
/// Only `content` is required on the wire; everything the server adds beyond
/// the known fields is kept in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "_id")]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub session_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, alias = "role", alias = "sender")]
    pub sender_role: SenderRole,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>, role: SenderRole) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            content: content.into(),
            timestamp: Some(Timestamp::Millis(now_ms())),
            sender_role: role,
            metadata: Map::new(),
        }
    }
}

/// Outbound `send_message` payload: `{ sessionId, content, timestamp, ...metadata }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub session_id: String,
    pub content: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Typing indicator payload. `userId` is filled in by the server on relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Server-reported chat failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Notification priority. Only `Low` changes delivery behavior; values the
/// client does not know decode as `Normal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    High,
    Urgent,
    #[default]
    #[serde(alias = "medium", other)]
    Normal,
}

impl Priority {
    /// Low priority is silent and auto-dismissed.
    pub fn is_low(self) -> bool {
        matches!(self, Priority::Low)
    }
}

/// A push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(alias = "_id", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, alias = "isRead")]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
}

impl Notification {
    pub fn new(id: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            message: message.into(),
            priority: Priority::Normal,
            read: false,
            url: None,
            kind: None,
            created_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }
}

/// Payload of `notification:read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRef {
    #[serde(alias = "_id", alias = "notificationId", deserialize_with = "string_or_number")]
    pub id: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "join_room")]
    JoinRoom(RoomRef),
    #[serde(rename = "leave_room")]
    LeaveRoom(RoomRef),
    #[serde(rename = "send_message")]
    SendMessage(OutgoingMessage),
    #[serde(rename = "typing")]
    Typing(RoomRef),
    #[serde(rename = "stop_typing")]
    StopTyping(RoomRef),
}

impl OutboundEvent {
    pub fn join(session_id: impl Into<String>) -> Self {
        OutboundEvent::JoinRoom(RoomRef::new(session_id))
    }

    pub fn leave(session_id: impl Into<String>) -> Self {
        OutboundEvent::LeaveRoom(RoomRef::new(session_id))
    }

    pub fn message(
        session_id: impl Into<String>,
        content: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        OutboundEvent::SendMessage(OutgoingMessage {
            session_id: session_id.into(),
            content: content.into(),
            timestamp: now_ms(),
            metadata,
        })
    }

    /// Room the event is scoped to.
    pub fn session_id(&self) -> &str {
        match self {
            OutboundEvent::JoinRoom(r)
            | OutboundEvent::LeaveRoom(r)
            | OutboundEvent::Typing(r)
            | OutboundEvent::StopTyping(r) => &r.session_id,
            OutboundEvent::SendMessage(m) => &m.session_id,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "message")]
    Message(ChatMessage),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "stop_typing")]
    StopTyping(TypingPayload),
    #[serde(rename = "chat_error")]
    ChatError(ChatErrorPayload),
    #[serde(rename = "room_joined")]
    RoomJoined(RoomRef),
    #[serde(rename = "room_left")]
    RoomLeft(RoomRef),
    #[serde(rename = "notification")]
    Notification(Notification),
    #[serde(rename = "notification:read")]
    NotificationRead(NotificationRef),
    #[serde(rename = "notification:update")]
    NotificationUpdate(Notification),
}

impl InboundEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Message(_) => "message",
            InboundEvent::Typing(_) => "typing",
            InboundEvent::StopTyping(_) => "stop_typing",
            InboundEvent::ChatError(_) => "chat_error",
            InboundEvent::RoomJoined(_) => "room_joined",
            InboundEvent::RoomLeft(_) => "room_left",
            InboundEvent::Notification(_) => "notification",
            InboundEvent::NotificationRead(_) => "notification:read",
            InboundEvent::NotificationUpdate(_) => "notification:update",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_shape() {
        let frame = OutboundEvent::join("room-7").encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({ "event": "join_room", "data": { "sessionId": "room-7" } }));
    }

    #[test]
    fn test_send_message_flattens_metadata() {
        let mut metadata = Map::new();
        metadata.insert("language".into(), json!("hi"));
        metadata.insert("cropId".into(), json!(42));

        let frame = OutboundEvent::message("room-7", "When to sow wheat?", metadata)
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["event"], "send_message");
        let data = &value["data"];
        assert_eq!(data["sessionId"], "room-7");
        assert_eq!(data["content"], "When to sow wheat?");
        assert_eq!(data["language"], "hi");
        assert_eq!(data["cropId"], 42);
        assert!(data["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_decode_minimal_message() {
        let event = InboundEvent::decode(r#"{"event":"message","data":{"id":1,"content":"hi"}}"#).unwrap();
        match event {
            InboundEvent::Message(msg) => {
                assert_eq!(msg.id, Some(MessageId::Number(1)));
                assert_eq!(msg.content, "hi");
                assert_eq!(msg.session_id, "");
                assert_eq!(msg.sender_role, SenderRole::User);
                assert!(msg.metadata.is_empty());
            }
            other => panic!("Expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_message_keeps_unknown_fields() {
        let frame = r#"{"event":"message","data":{
            "_id":"m-1","sessionId":"room-7","content":"Use neem oil",
            "timestamp":"2024-06-01T10:00:00Z","role":"assistant","confidence":0.9}}"#;
        let InboundEvent::Message(msg) = InboundEvent::decode(frame).unwrap() else {
            panic!("Expected message");
        };
        assert_eq!(msg.id, Some(MessageId::Text("m-1".into())));
        assert_eq!(msg.sender_role, SenderRole::Assistant);
        assert_eq!(msg.timestamp, Some(Timestamp::Text("2024-06-01T10:00:00Z".into())));
        assert_eq!(msg.metadata.get("confidence"), Some(&json!(0.9)));
    }

    #[test]
    fn test_unknown_sender_role_decodes_as_other() {
        let frame = r#"{"event":"message","data":{"content":"x","senderRole":"moderator"}}"#;
        let InboundEvent::Message(msg) = InboundEvent::decode(frame).unwrap() else {
            panic!("Expected message");
        };
        assert_eq!(msg.sender_role, SenderRole::Other);
    }

    #[test]
    fn test_decode_notification_events() {
        let frame = r#"{"event":"notification","data":{"_id":17,"title":"Rain alert",
            "message":"Heavy rain expected","priority":"high","url":"/weather"}}"#;
        let InboundEvent::Notification(n) = InboundEvent::decode(frame).unwrap() else {
            panic!("Expected notification");
        };
        assert_eq!(n.id, "17");
        assert_eq!(n.priority, Priority::High);
        assert!(!n.read);
        assert_eq!(n.url.as_deref(), Some("/weather"));

        let read = InboundEvent::decode(r#"{"event":"notification:read","data":{"id":"17"}}"#).unwrap();
        assert_eq!(read, InboundEvent::NotificationRead(NotificationRef { id: "17".into() }));
        assert_eq!(read.name(), "notification:read");

        let update = InboundEvent::decode(
            r#"{"event":"notification:update","data":{"id":"17","isRead":true,"priority":"medium"}}"#,
        )
        .unwrap();
        let InboundEvent::NotificationUpdate(n) = update else {
            panic!("Expected update");
        };
        assert!(n.read);
        assert_eq!(n.priority, Priority::Normal);
    }

    #[test]
    fn test_unknown_priority_is_normal() {
        let n: Notification =
            serde_json::from_value(json!({ "id": "1", "priority": "critical" })).unwrap();
        assert_eq!(n.priority, Priority::Normal);
        assert!(!n.priority.is_low());
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(InboundEvent::decode(r#"{"event":"mesage","data":{"content":"x"}}"#).is_err());
        assert!(OutboundEvent::decode(r#"{"event":"join","data":{"sessionId":"a"}}"#).is_err());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(InboundEvent::decode("not json").is_err());
        assert!(InboundEvent::decode(r#"{"event":"message"}"#).is_err());
    }

    #[test]
    fn test_outbound_session_id() {
        assert_eq!(OutboundEvent::join("a").session_id(), "a");
        assert_eq!(OutboundEvent::message("b", "x", Map::new()).session_id(), "b");
        assert_eq!(OutboundEvent::StopTyping(RoomRef::new("c")).session_id(), "c");
    }

    #[test]
    fn test_notification_id_rejects_object() {
        let result: Result<Notification, _> = serde_json::from_value(json!({ "id": { "x": 1 } }));
        assert!(result.is_err());
    }
}
