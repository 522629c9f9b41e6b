//! Connection lifecycle state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the single logical bus connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Initial connect loop is running.
    Connecting,
    /// Connection is live.
    Connected,
    /// Connection dropped; the transport is reconnecting on its own.
    Reconnecting,
    /// Connect exhausted its retries, config was missing, or the transport
    /// reported an error.
    Error,
    /// Connection was drained or closed for good.
    Closed,
}

impl ConnectionState {
    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    /// Whether a connection exists or is being established.
    ///
    /// `connect()` is a no-op in these states.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
