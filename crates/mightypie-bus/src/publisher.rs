//! Fire-and-forget publishing on the managed connection.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::error::{BusError, PublishFailure};
use crate::metrics::{BUS_PUBLISHES_TOTAL, BUS_PUBLISH_ERRORS_TOTAL};

/// Serializes messages as JSON and sends them.
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    /// Publisher bound to a connection manager.
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Serialize `message` as JSON and send it on `subject`.
    ///
    /// Nothing reaches the wire while disconnected.
    pub async fn publish<T: Serialize + ?Sized>(&self, subject: &str, message: &T) -> Result<(), BusError> {
        if !self.connection.is_connected() {
            return Err(rejected(subject, PublishFailure::NotConnected));
        }
        let payload = serde_json::to_vec(message)
            .map_err(|err| rejected(subject, PublishFailure::Serialize(err)))?;
        self.send(subject, Bytes::from(payload)).await
    }

    /// Send an already-encoded payload.
    pub async fn publish_raw(&self, subject: &str, payload: &str) -> Result<(), BusError> {
        self.send(subject, Bytes::copy_from_slice(payload.as_bytes())).await
    }

    async fn send(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        let Some(conn) = self.connection.live_connection() else {
            return Err(rejected(subject, PublishFailure::NotConnected));
        };
        let len = payload.len();
        conn.publish(subject, payload)
            .await
            .map_err(|err| rejected(subject, PublishFailure::Transport(err.to_string())))?;
        counter!(BUS_PUBLISHES_TOTAL).increment(1);
        debug!(subject, bytes = len, "published");
        Ok(())
    }
}

fn rejected(subject: &str, failure: PublishFailure) -> BusError {
    let reason = match &failure {
        PublishFailure::NotConnected => "not_connected",
        PublishFailure::Serialize(_) => "serialize",
        PublishFailure::Transport(_) => "transport",
    };
    counter!(BUS_PUBLISH_ERRORS_TOTAL, "reason" => reason).increment(1);
    warn!(subject, error = %failure, "publish rejected");
    BusError::PublishFailed(failure)
}
