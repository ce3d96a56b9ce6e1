// src/realtime/types.rs

//! Connection states, their history, and the reconnect policy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::{ClientConfig, RealtimeSettings};

/// A topic key, e.g. `/topic/posts/42`.
pub type Topic = String;

/// Lifecycle of the broker connection.
///
/// ```text
/// Disconnected -> Connecting -> Connected
/// Connecting   -> Error                      (handshake refused)
/// Connected    -> Reconnecting -> Connecting (transport dropped)
/// Reconnecting -> Error                      (attempt ceiling reached)
/// any          -> Disconnected               (explicit disconnect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One entry of the state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: ConnectionState,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
    /// Set on `Reconnecting` entries.
    pub attempt: Option<u32>,
}

impl StateChange {
    pub(crate) fn now(state: ConnectionState) -> Self {
        Self {
            state,
            at: Utc::now(),
            error: None,
            attempt: None,
        }
    }

    pub(crate) fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub(crate) fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Linear backoff with a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub history_limit: usize,
}

impl ReconnectPolicy {
    /// `base_delay × attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ClientConfig::default().realtime)
    }
}

impl From<&RealtimeSettings> for ReconnectPolicy {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base_delay(),
            max_attempts: settings.max_reconnect_attempts,
            history_limit: settings.state_history_limit,
        }
    }
}
