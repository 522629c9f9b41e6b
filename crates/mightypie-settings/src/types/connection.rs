use std::fmt;

use serde::{Deserialize, Serialize};

/// Server address, credentials and client-side connection options.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Bus server URL (`ws://`, `nats://`, `tls://`). Usually from `NATS_SERVER_URL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Auth token. Usually from `NATS_AUTH_TOKEN`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Name reported to the server for this client.
    pub client_name: String,
    /// Timeout for a single connection attempt.
    pub connection_timeout_ms: u64,
    /// Wait between the bus client's own reconnect attempts after a drop.
    pub reconnect_time_wait_ms: u64,
    /// Reconnect attempts after a drop before the client gives up.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            auth_token: None,
            client_name: "mightypie-ui".to_string(),
            connection_timeout_ms: 5000,
            reconnect_time_wait_ms: 5000,
            max_reconnect_attempts: 5,
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("server_url", &self.server_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("client_name", &self.client_name)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("reconnect_time_wait_ms", &self.reconnect_time_wait_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

/// Delay growth between initial connection attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffKind {
    /// Same delay before every attempt.
    #[default]
    Fixed,
    /// `delay * 2^attempt`, capped at `maxDelayMs`.
    Exponential,
}

/// Initial-connect retry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Total connection attempts before `connect()` fails.
    pub max_retries: u32,
    /// Delay between attempts in milliseconds.
    pub delay_ms: u64,
    /// Delay growth strategy.
    pub backoff: BackoffKind,
    /// Upper bound for exponential delays.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 15,
            delay_ms: 1000,
            backoff: BackoffKind::Fixed,
            max_delay_ms: 30_000,
        }
    }
}
