//! Error types for the bus client.
//!
//! Setup-time failures are returned as [`BusError`]. Failures while
//! delivering a single message are [`DeliveryError`]s, which are logged and
//! counted but never propagated.

use thiserror::Error;

/// Errors returned by connect, subscribe, publish and stream operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Server URL or auth token is not configured.
    #[error("missing bus configuration: {0}")]
    ConfigMissing(String),

    /// Every initial connect attempt failed.
    #[error("connect failed after {attempts} attempts: {last_error}")]
    ConnectFailed {
        /// Number of attempts made.
        attempts: u32,
        /// Error reported by the final attempt.
        last_error: String,
    },

    /// Registering a subscription or durable consumer failed.
    #[error("subscribe to '{subject}' failed: {reason}")]
    SubscribeFailed {
        /// Subject that was being subscribed.
        subject: String,
        /// Why it failed.
        reason: String,
    },

    /// A publish was rejected.
    #[error("publish failed: {0}")]
    PublishFailed(#[from] PublishFailure),

    /// Draining the connection failed.
    #[error("drain failed: {0}")]
    DrainFailed(String),

    /// Events stream management failed.
    #[error("stream error: {0}")]
    Stream(String),
}

/// Why a publish was rejected.
#[derive(Debug, Error)]
pub enum PublishFailure {
    /// No live connection; nothing was sent.
    #[error("not connected")]
    NotConnected,
    /// The message could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The transport refused the message.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish a connection.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Subject rejected or subscription could not be registered.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// Message could not be sent.
    #[error("publish failed: {0}")]
    Publish(String),
    /// Durable consumer creation, lookup or ack failed.
    #[error("consumer error: {0}")]
    Consumer(String),
    /// Stream create, info or purge failed.
    #[error("stream error: {0}")]
    Stream(String),
    /// Drain failed.
    #[error("drain failed: {0}")]
    Drain(String),
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

/// Failure while delivering one message to one handler.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Payload was not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),
    /// Handler returned an error.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
    /// Handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DeliveryError {
    /// Short label used for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Handler(_) => "handler",
            Self::Panicked(_) => "panic",
        }
    }
}

/// Result alias for bus operations.
pub type Result<T, E = BusError> = std::result::Result<T, E>;
