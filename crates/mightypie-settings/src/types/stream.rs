use serde::{Deserialize, Serialize};

/// Persisted events stream configuration.
///
/// Every "latest value" subject lives under `subject_root`; the stream keeps
/// one message per subject so a durable consumer can replay the newest one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Stream name on the server.
    pub name: String,
    /// Literal subject prefix captured by the stream (`<root>.>`).
    /// Usually from `PUBLIC_NATSSUBJECT_STREAM`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_root: Option<String>,
    /// Total messages retained by the stream.
    pub max_messages: i64,
    /// Messages retained per subject.
    pub max_messages_per_subject: i64,
    /// Create or update the stream right after connecting.
    pub ensure_on_connect: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "MIGHTYPIE_EVENTS".to_string(),
            subject_root: None,
            max_messages: 50,
            max_messages_per_subject: 1,
            ensure_on_connect: false,
        }
    }
}

impl StreamSettings {
    /// Subject filter the stream captures, e.g. `mightyPie.events.>`.
    pub fn subject_filter(&self) -> Option<String> {
        self.subject_root.as_ref().map(|root| format!("{root}.>"))
    }
}

/// What happens to the server-side durable consumer once no local handler uses it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DurableCleanup {
    /// Leave the consumer on the server so its cursor survives.
    #[default]
    RetainRemote,
    /// Delete the consumer; the next registration replays the latest message again.
    DeleteRemote,
}

/// Durable consumer lifecycle policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DurableSettings {
    /// Remote consumer handling when the local handler set drains.
    pub cleanup: DurableCleanup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_filter_appends_wildcard() {
        let stream = StreamSettings {
            subject_root: Some("mightyPie.events".into()),
            ..StreamSettings::default()
        };
        assert_eq!(stream.subject_filter().as_deref(), Some("mightyPie.events.>"));
    }

    #[test]
    fn subject_filter_none_without_root() {
        assert!(StreamSettings::default().subject_filter().is_none());
    }

    #[test]
    fn durable_cleanup_parses() {
        let settings: DurableSettings =
            serde_json::from_str(r#"{"cleanup": "deleteRemote"}"#).unwrap();
        assert_eq!(settings.cleanup, DurableCleanup::DeleteRemote);
    }
}
