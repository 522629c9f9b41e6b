//! Management of the persisted events stream backing "latest value" subjects.

use std::sync::Arc;

use mightypie_settings::StreamSettings;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::error::BusError;
use crate::transport::{BusConnection, StreamInfo, StreamSpec};

/// Creates, inspects and purges the events stream.
#[derive(Clone)]
pub struct StreamAdmin {
    connection: Arc<ConnectionManager>,
    settings: StreamSettings,
}

impl StreamAdmin {
    /// Admin for the stream described by `settings`.
    pub fn new(connection: Arc<ConnectionManager>, settings: StreamSettings) -> Self {
        Self {
            connection,
            settings,
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Stream configuration: `<subject_root>.>` with the configured limits.
    pub fn spec(&self) -> Result<StreamSpec, BusError> {
        let filter = self.settings.subject_filter().ok_or_else(|| {
            BusError::ConfigMissing("stream subject root (PUBLIC_NATSSUBJECT_STREAM) is not set".into())
        })?;
        Ok(StreamSpec {
            name: self.settings.name.clone(),
            subjects: vec![filter],
            max_messages: self.settings.max_messages,
            max_messages_per_subject: self.settings.max_messages_per_subject,
        })
    }

    /// Create the stream, or bring an existing one in line with the config.
    pub async fn ensure_events_stream(&self) -> Result<StreamInfo, BusError> {
        let spec = self.spec()?;
        let conn = self.live()?;
        let info = conn.ensure_stream(&spec).await.map_err(|err| {
            warn!(stream = %spec.name, error = %err, "failed to ensure events stream");
            BusError::Stream(err.to_string())
        })?;
        info!(
            stream = %info.name,
            subjects = ?info.subjects,
            messages = info.messages,
            first_seq = info.first_seq,
            last_seq = info.last_seq,
            bytes = info.bytes,
            "events stream ready"
        );
        Ok(info)
    }

    /// Current stream state.
    pub async fn stream_info(&self) -> Result<StreamInfo, BusError> {
        let conn = self.live()?;
        conn.stream_info(&self.settings.name)
            .await
            .map_err(|err| BusError::Stream(err.to_string()))
    }

    /// Delete every stored message.
    pub async fn purge_events_stream(&self) -> Result<(), BusError> {
        let conn = self.live()?;
        conn.purge_stream(&self.settings.name)
            .await
            .map_err(|err| BusError::Stream(err.to_string()))?;
        info!(stream = %self.settings.name, "events stream purged");
        Ok(())
    }

    fn live(&self) -> Result<Arc<dyn BusConnection>, BusError> {
        self.connection
            .live_connection()
            .ok_or_else(|| BusError::Stream("not connected".into()))
    }
}
