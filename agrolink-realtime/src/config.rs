//! Channel configuration.
//!
//! Defaults match the backend's socket settings. `from_env()` applies
//! `AGROLINK_*` overrides on top of the defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::connection::ReconnectPolicy;
use crate::error::ConfigError;

/// Native notification behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// How long a low-priority toast stays on screen.
    pub low_priority_dismiss: Duration,
    /// Icon shown on native toasts.
    pub icon: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            low_priority_dismiss: Duration::from_secs(5),
            icon: Some("/logo192.png".to_string()),
        }
    }
}

/// Realtime channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// WebSocket endpoint of the realtime service.
    pub url: String,
    /// Quiet period after which typing is considered stopped.
    pub typing_quiet_period: Duration,
    /// Reconnection backoff after a transport drop.
    pub reconnect: ReconnectPolicy,
    /// Frames buffered towards the writer task.
    pub outbox_capacity: usize,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
    pub notifications: NotificationConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000/realtime".to_string(),
            typing_quiet_period: Duration::from_secs(3),
            reconnect: ReconnectPolicy::default(),
            outbox_capacity: 256,
            event_capacity: 256,
            notifications: NotificationConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Defaults with a custom endpoint.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `AGROLINK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("AGROLINK_WS_URL") {
            config.url = url;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AGROLINK_TYPING_QUIET_MS")? {
            config.typing_quiet_period = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AGROLINK_RECONNECT_DELAY_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AGROLINK_RECONNECT_DELAY_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("AGROLINK_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = if raw.eq_ignore_ascii_case("unlimited") {
                None
            } else {
                Some(parse_value("AGROLINK_RECONNECT_ATTEMPTS", &raw)?)
            };
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AGROLINK_LOW_PRIORITY_DISMISS_MS")? {
            config.notifications.low_priority_dismiss = Duration::from_millis(ms);
        }
        if let Some(icon) = lookup("AGROLINK_NOTIFICATION_ICON") {
            config.notifications.icon = if icon.is_empty() { None } else { Some(icon) };
        }

        Ok(config)
    }
}

/// Parse an optional variable into `T`.
pub(crate) fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|raw| parse_value(key, &raw)).transpose()
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
