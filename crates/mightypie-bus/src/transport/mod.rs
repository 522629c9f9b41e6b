//! The seam between the bus core and a concrete message-bus client.
//!
//! [`Transport`] opens connections; a [`BusConnection`] offers plain
//! subscriptions, publishing, durable consumers on a persisted stream and
//! stream administration. Everything above this module talks only to these
//! traits, so the core runs unchanged against [`memory::MemoryBus`] in tests
//! and against NATS (feature `nats`) in the app.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mightypie_settings::BusSettings;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{BusError, TransportError};

// ─────────────────────────────────────────────────────────────────────────────
// Connect parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to open one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Server URL.
    pub server_url: String,
    /// Auth token.
    pub auth_token: String,
    /// Client name reported to the server.
    pub client_name: String,
    /// Bound on a single connect attempt.
    pub connection_timeout: Duration,
    /// Transport-level wait between reconnects after a drop.
    pub reconnect_time_wait: Duration,
    /// Transport-level reconnect limit after a drop.
    pub max_reconnect_attempts: u32,
}

impl ConnectParams {
    /// Parameters with default timeouts for the given server and token.
    pub fn new(server_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let defaults = mightypie_settings::ConnectionSettings::default();
        Self {
            server_url: server_url.into(),
            auth_token: auth_token.into(),
            client_name: defaults.client_name,
            connection_timeout: Duration::from_millis(defaults.connection_timeout_ms),
            reconnect_time_wait: Duration::from_millis(defaults.reconnect_time_wait_ms),
            max_reconnect_attempts: defaults.max_reconnect_attempts,
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("server_url", &self.server_url)
            .field("auth_token", &"<redacted>")
            .field("client_name", &self.client_name)
            .field("connection_timeout", &self.connection_timeout)
            .field("reconnect_time_wait", &self.reconnect_time_wait)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

/// Where the connection manager reads its parameters from on each `connect()`.
pub trait ParamsSource: Send + Sync {
    /// Current parameters, or `ConfigMissing` when URL or token are absent.
    fn connect_params(&self) -> Result<ConnectParams, BusError>;
}

impl ParamsSource for ConnectParams {
    fn connect_params(&self) -> Result<ConnectParams, BusError> {
        if self.server_url.trim().is_empty() {
            return Err(BusError::ConfigMissing("server URL".into()));
        }
        if self.auth_token.is_empty() {
            return Err(BusError::ConfigMissing("auth token".into()));
        }
        Ok(self.clone())
    }
}

impl ParamsSource for BusSettings {
    fn connect_params(&self) -> Result<ConnectParams, BusError> {
        let conn = &self.connection;
        let server_url = conn
            .server_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| BusError::ConfigMissing("NATS_SERVER_URL is not set".into()))?;
        let auth_token = conn
            .auth_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| BusError::ConfigMissing("NATS_AUTH_TOKEN is not set".into()))?;

        Ok(ConnectParams {
            server_url: server_url.to_owned(),
            auth_token: auth_token.to_owned(),
            client_name: conn.client_name.clone(),
            connection_timeout: Duration::from_millis(conn.connection_timeout_ms),
            reconnect_time_wait: Duration::from_millis(conn.reconnect_time_wait_ms),
            max_reconnect_attempts: conn.max_reconnect_attempts,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status events and stream types
// ─────────────────────────────────────────────────────────────────────────────

/// Asynchronous connection status reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    /// Connection dropped; the transport is reconnecting.
    Disconnect,
    /// Connection re-established.
    Reconnect,
    /// Transport-level error.
    Error(String),
    /// Connection closed for good. Nothing follows.
    Closed,
}

/// Durable consumer to create or attach to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DurableSpec {
    /// Stream the consumer reads from.
    pub stream: String,
    /// Durable name, stable across restarts.
    pub name: String,
    /// Only messages on this subject are delivered.
    pub filter_subject: String,
}

/// Persisted stream configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    /// Stream name.
    pub name: String,
    /// Subjects captured by the stream.
    pub subjects: Vec<String>,
    /// Total message limit (`-1` for unlimited).
    pub max_messages: i64,
    /// Messages kept per subject.
    pub max_messages_per_subject: i64,
}

/// Stream state snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Subjects captured by the stream.
    pub subjects: Vec<String>,
    /// Messages currently stored.
    pub messages: u64,
    /// Oldest stored sequence.
    pub first_seq: u64,
    /// Newest sequence ever stored.
    pub last_seq: u64,
    /// Stored payload bytes.
    pub bytes: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Opens connections to a bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one connection. A single attempt; the caller owns retries.
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BusConnection>, TransportError>;
}

/// One live connection.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Server this connection points at, for logs.
    fn server(&self) -> String;

    /// Whether the connection has been drained or closed.
    fn is_closed(&self) -> bool;

    /// Take the status event stream. Returns `None` after the first call.
    ///
    /// The stream ends once the connection is closed.
    fn status_events(&self) -> Option<mpsc::UnboundedReceiver<StatusEvent>>;

    /// Plain subscription on a subject (wildcards allowed).
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn RawSubscription>, TransportError>;

    /// Send one message.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Create or attach to a durable consumer.
    ///
    /// A newly created consumer starts with the last message per subject and
    /// requires explicit acks.
    async fn durable_consumer(
        &self,
        spec: &DurableSpec,
    ) -> Result<Box<dyn DurableConsumer>, TransportError>;

    /// Newest message stored in `stream` on `subject`, if any.
    async fn last_message(
        &self,
        stream: &str,
        subject: &str,
    ) -> Result<Option<LastMessage>, TransportError>;

    /// Delete a durable consumer on the server.
    async fn delete_durable(&self, stream: &str, name: &str) -> Result<(), TransportError>;

    /// Create the stream, or update its config if it exists.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamInfo, TransportError>;

    /// Current stream state.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, TransportError>;

    /// Delete every message in the stream.
    async fn purge_stream(&self, stream: &str) -> Result<(), TransportError>;

    /// Flush pending work and close the connection.
    async fn drain(&self) -> Result<(), TransportError>;
}

/// A plain subject subscription.
#[async_trait]
pub trait RawSubscription: Send {
    /// Next payload, or `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Bytes>;

    /// Stop receiving.
    async fn unsubscribe(self: Box<Self>);
}

/// Pull side of a durable consumer.
#[async_trait]
pub trait DurableConsumer: Send {
    /// Next message, or `None` once the consumer or connection is gone.
    async fn next(&mut self) -> Option<Result<DurableMessage, TransportError>>;
}

/// Acknowledges one durable message.
#[async_trait]
pub trait Acker: Send {
    /// Ack the message this acker belongs to.
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
}

/// Newest stored message on a subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastMessage {
    /// Stream sequence.
    pub seq: u64,
    /// Raw payload.
    pub payload: Bytes,
}

/// A message delivered by a durable consumer.
pub struct DurableMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Stream sequence.
    pub seq: u64,
    /// Raw payload.
    pub payload: Bytes,
    acker: Box<dyn Acker>,
}

impl DurableMessage {
    /// Wrap a payload with its acker.
    pub fn new(
        subject: impl Into<String>,
        seq: u64,
        payload: Bytes,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            seq,
            payload,
            acker,
        }
    }

    /// Acknowledge the message.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for DurableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableMessage")
            .field("subject", &self.subject)
            .field("seq", &self.seq)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
