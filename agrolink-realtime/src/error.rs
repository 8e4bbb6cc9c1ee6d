//! Error types for the realtime channel.
//!
//! Transport failures are recovered inside the channel (reconnection) and
//! only ever surface as a [`ConnectionState`](crate::connection::ConnectionState).
//! Everything in [`ChannelError`] is returned to the caller that triggered it.

use thiserror::Error;

/// Failures establishing or maintaining the underlying link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Credential cannot be sent as a bearer header")]
    InvalidCredential,

    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Link closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Handshake(e.to_string())
    }
}

/// Wire encode/decode failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Errors reported to callers of the channel API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Not connected")]
    NotConnected,

    #[error("A non-empty credential is required to connect")]
    MissingCredential,

    #[error("Outbox closed before the frame could be queued")]
    OutboxClosed,

    #[error("Outbox full; the link is not draining")]
    OutboxFull,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of the native notification surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifierError {
    #[error("Notification permission not granted")]
    PermissionDenied,

    #[error("Native notification surface unavailable: {0}")]
    Unavailable(String),
}

/// Invalid configuration overrides.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_from_protocol() {
        let err: ChannelError = ProtocolError::Serialization("boom".into()).into();
        assert_eq!(err.to_string(), "Serialization error: boom");
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::InvalidValue {
            key: "AGROLINK_RECONNECT_ATTEMPTS",
            value: "many".into(),
            reason: "invalid digit found in string".into(),
        };
        assert!(err.to_string().contains("AGROLINK_RECONNECT_ATTEMPTS"));
        assert!(err.to_string().contains("'many'"));
    }
}
