//! Connection lifecycle state machine and reconnection policy.
//!
//! ```text
//! disconnected --connect--> connecting --established--> connected
//!                               │                          │
//!                            failed                   transport drop
//!                               ▼                          ▼
//!                            failed <--exhausted-- reconnecting
//!                               │                          │
//!                               └──connect──> connecting   └──established--> connected
//!
//! {connecting, connected, reconnecting, failed} --disconnect--> disconnected
//! ```

use std::time::Duration;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection gave up or the first attempt failed; needs an explicit `connect()`.
    Failed,
}

impl ConnectionState {
    /// A connection is open or being (re)established.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    /// Apply a trigger, returning the next state or `None` if the
    /// transition is not part of the lifecycle.
    pub fn next(self, trigger: Trigger) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, trigger) {
            (Disconnected | Failed, Trigger::Connect) => Some(Connecting),
            (Connecting | Reconnecting, Trigger::Established) => Some(Connected),
            (Connecting, Trigger::Failed) => Some(Failed),
            (Connected, Trigger::TransportDrop) => Some(Reconnecting),
            (Reconnecting, Trigger::Exhausted) => Some(Failed),
            (_, Trigger::Disconnect) => Some(Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    Established,
    Failed,
    TransportDrop,
    Exhausted,
    Disconnect,
}

/// Transport-level lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A reconnection attempt is starting (1-based).
    ReconnectAttempt { attempt: u32 },
    /// A reconnection attempt failed.
    ReconnectError { attempt: u32, error: String },
    /// The link came back after a drop.
    Reconnected,
    /// All reconnection attempts were used up.
    ReconnectFailed,
}

/// Exponential backoff for reconnection after a transport drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: Some(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt following `failed_attempts` failures.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether `failed_attempts` has used up the budget.
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| failed_attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_canonical_transitions() {
        assert_eq!(Disconnected.next(Trigger::Connect), Some(Connecting));
        assert_eq!(Connecting.next(Trigger::Established), Some(Connected));
        assert_eq!(Connecting.next(Trigger::Failed), Some(Failed));
        assert_eq!(Connected.next(Trigger::TransportDrop), Some(Reconnecting));
        assert_eq!(Reconnecting.next(Trigger::Established), Some(Connected));
        assert_eq!(Reconnecting.next(Trigger::Exhausted), Some(Failed));
        assert_eq!(Failed.next(Trigger::Connect), Some(Connecting));
    }

    #[test]
    fn test_disconnect_from_any_state() {
        for state in [Disconnected, Connecting, Connected, Reconnecting, Failed] {
            assert_eq!(state.next(Trigger::Disconnect), Some(Disconnected));
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert_eq!(Connected.next(Trigger::Connect), None);
        assert_eq!(Connecting.next(Trigger::Connect), None);
        assert_eq!(Disconnected.next(Trigger::Established), None);
        assert_eq!(Disconnected.next(Trigger::TransportDrop), None);
        assert_eq!(Connected.next(Trigger::Exhausted), None);
        assert_eq!(Failed.next(Trigger::Established), None);
    }

    #[test]
    fn test_is_live() {
        assert!(Connecting.is_live());
        assert!(Connected.is_live());
        assert!(Reconnecting.is_live());
        assert!(!Disconnected.is_live());
        assert!(!Failed.is_live());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_exhaustion() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));

        let unlimited = ReconnectPolicy {
            max_attempts: None,
            ..ReconnectPolicy::default()
        };
        assert!(!unlimited.is_exhausted(u32::MAX));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(Reconnecting.to_string(), "reconnecting");
        assert_eq!(Failed.to_string(), "failed");
    }
}
