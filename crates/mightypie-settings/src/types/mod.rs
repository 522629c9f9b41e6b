//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` so the settings file
//! matches the JSON the desktop UI writes. Each type implements [`Default`]
//! with production values, and `#[serde(default)]` lets partial JSON fill
//! missing fields from those defaults.

mod connection;
mod stream;

pub use connection::*;
pub use stream::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the bus client.
///
/// ```json
/// {
///   "connection": { "clientName": "mightypie-ui" },
///   "retry": { "maxRetries": 15, "delayMs": 1000 },
///   "stream": { "subjectRoot": "mightyPie.events" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Server address, credentials and client-side timeouts.
    pub connection: ConnectionSettings,
    /// Initial-connect retry policy.
    pub retry: RetrySettings,
    /// Persisted events stream used for "latest value" subjects.
    pub stream: StreamSettings,
    /// Durable consumer lifecycle policy.
    pub durable: DurableSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "mightypie".to_string(),
            connection: ConnectionSettings::default(),
            retry: RetrySettings::default(),
            stream: StreamSettings::default(),
            durable: DurableSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl BusSettings {
    /// Correct out-of-range values and reject settings the client cannot run with.
    ///
    /// Numeric fields are clamped with a warning. An empty stream name or a
    /// subject root containing wildcards is an error.
    pub fn validate(&mut self) -> Result<()> {
        if self.retry.max_retries == 0 {
            tracing::warn!("retry.maxRetries is 0, using 1");
            self.retry.max_retries = 1;
        }
        if self.retry.max_delay_ms < self.retry.delay_ms {
            tracing::warn!(
                "retry.maxDelayMs ({}) < retry.delayMs ({}), correcting",
                self.retry.max_delay_ms,
                self.retry.delay_ms
            );
            self.retry.max_delay_ms = self.retry.delay_ms;
        }
        if self.stream.max_messages_per_subject < 1 {
            tracing::warn!(
                value = self.stream.max_messages_per_subject,
                "stream.maxMessagesPerSubject must be positive, using 1"
            );
            self.stream.max_messages_per_subject = 1;
        }

        if self.stream.name.trim().is_empty() {
            return Err(SettingsError::InvalidValue("stream.name is empty".into()));
        }
        if let Some(root) = &self.stream.subject_root {
            if root.contains(['*', '>', ' ']) {
                return Err(SettingsError::InvalidValue(format!(
                    "stream.subjectRoot must be a literal subject, got {root:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"retry": {"maxRetries": 3}}"#;
        let settings: BusSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.delay_ms, 1000);
        assert_eq!(settings.stream.name, "MIGHTYPIE_EVENTS");
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(BusSettings::default()).unwrap();
        assert!(value["retry"].get("maxRetries").is_some());
        assert!(value["stream"].get("maxMessagesPerSubject").is_some());
        assert_eq!(value["durable"]["cleanup"], "retainRemote");
        assert_eq!(value["retry"]["backoff"], "fixed");
    }

    #[test]
    fn validate_clamps_zero_retries() {
        let mut settings = BusSettings::default();
        settings.retry.max_retries = 0;
        settings.validate().unwrap();
        assert_eq!(settings.retry.max_retries, 1);
    }

    #[test]
    fn validate_corrects_max_delay_below_delay() {
        let mut settings = BusSettings::default();
        settings.retry.delay_ms = 5000;
        settings.retry.max_delay_ms = 100;
        settings.validate().unwrap();
        assert_eq!(settings.retry.max_delay_ms, 5000);
    }

    #[test]
    fn validate_rejects_wildcard_subject_root() {
        let mut settings = BusSettings::default();
        settings.stream.subject_root = Some("mightyPie.>".into());
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_empty_stream_name() {
        let mut settings = BusSettings::default();
        settings.stream.name = "  ".into();
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }
}
