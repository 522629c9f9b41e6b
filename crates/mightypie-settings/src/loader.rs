//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BusSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. [`BusSettings::validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BusSettings;

/// Env var that points at an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "MIGHTYPIE_SETTINGS";

/// Resolve the settings file path.
///
/// `MIGHTYPIE_SETTINGS` wins; otherwise `~/.mightypie/bus.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string(SETTINGS_PATH_ENV) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| std::env::temp_dir().to_string_lossy().into_owned());
    PathBuf::from(home).join(".mightypie").join("bus.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BusSettings> {
    let defaults = serde_json::to_value(BusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BusSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut BusSettings) {
    apply_overrides_with(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Empty values are treated as unset. Numbers must parse and fall within
/// range; invalid values are ignored with a warning (file/default wins).
pub fn apply_overrides_with(settings: &mut BusSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = string("NATS_SERVER_URL") {
        settings.connection.server_url = Some(v);
    }
    if let Some(v) = string("NATS_AUTH_TOKEN") {
        settings.connection.auth_token = Some(v);
    }
    if let Some(v) = string("MIGHTYPIE_NATS_CLIENT_NAME") {
        settings.connection.client_name = v;
    }

    // ── Retry ───────────────────────────────────────────────────────
    if let Some(raw) = string("MIGHTYPIE_NATS_MAX_RETRIES") {
        match parse_u32_range(&raw, 1, 1000) {
            Some(v) => settings.retry.max_retries = v,
            None => warn_invalid("MIGHTYPIE_NATS_MAX_RETRIES", &raw),
        }
    }
    if let Some(raw) = string("MIGHTYPIE_NATS_RETRY_DELAY_MS") {
        match parse_u64_range(&raw, 0, 600_000) {
            Some(v) => settings.retry.delay_ms = v,
            None => warn_invalid("MIGHTYPIE_NATS_RETRY_DELAY_MS", &raw),
        }
    }

    // ── Stream ──────────────────────────────────────────────────────
    if let Some(v) = string("PUBLIC_NATSSUBJECT_STREAM") {
        settings.stream.subject_root = Some(v);
    }
    if let Some(raw) = string("MIGHTYPIE_STREAM_ENSURE") {
        match parse_bool(&raw) {
            Some(v) => settings.stream.ensure_on_connect = v,
            None => warn_invalid("MIGHTYPIE_STREAM_ENSURE", &raw),
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("MIGHTYPIE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn warn_invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "invalid env override, ignoring");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;
    use crate::types::BackoffKind;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn deep_merge_nested_objects() {
        let target = serde_json::json!({"retry": {"maxRetries": 15, "delayMs": 1000}});
        let source = serde_json::json!({"retry": {"delayMs": 250}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["retry"]["maxRetries"], 15);
        assert_eq!(merged["retry"]["delayMs"], 250);
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let target = serde_json::json!({"name": "mightypie"});
        let source = serde_json::json!({"name": null});
        assert_eq!(deep_merge(target, source)["name"], "mightypie");
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let target = serde_json::json!({"a": [1, 2, 3]});
        let source = serde_json::json!({"a": [9]});
        assert_eq!(deep_merge(target, source)["a"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.stream.name, "MIGHTYPIE_EVENTS");
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.json");
        std::fs::write(
            &path,
            r#"{"retry": {"backoff": "exponential"}, "stream": {"subjectRoot": "mightyPie.events"}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.retry.backoff, BackoffKind::Exponential);
        assert_eq!(settings.retry.max_retries, 15);
        assert_eq!(settings.stream.subject_root.as_deref(), Some("mightyPie.events"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn overrides_apply_credentials_and_stream() {
        let mut settings = BusSettings::default();
        apply_overrides_with(
            &mut settings,
            lookup_from(&[
                ("NATS_SERVER_URL", "ws://localhost:9090"),
                ("NATS_AUTH_TOKEN", "secret"),
                ("PUBLIC_NATSSUBJECT_STREAM", "mightyPie.events"),
                ("MIGHTYPIE_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(settings.connection.server_url.as_deref(), Some("ws://localhost:9090"));
        assert_eq!(settings.connection.auth_token.as_deref(), Some("secret"));
        assert_eq!(settings.stream.subject_root.as_deref(), Some("mightyPie.events"));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn overrides_ignore_empty_and_invalid_values() {
        let mut settings = BusSettings::default();
        apply_overrides_with(
            &mut settings,
            lookup_from(&[
                ("NATS_SERVER_URL", ""),
                ("MIGHTYPIE_NATS_MAX_RETRIES", "lots"),
                ("MIGHTYPIE_NATS_RETRY_DELAY_MS", "99999999"),
                ("MIGHTYPIE_STREAM_ENSURE", "maybe"),
            ]),
        );
        assert!(settings.connection.server_url.is_none());
        assert_eq!(settings.retry.max_retries, 15);
        assert_eq!(settings.retry.delay_ms, 1000);
        assert!(!settings.stream.ensure_on_connect);
    }

    #[test]
    fn overrides_parse_numbers_and_bools() {
        let mut settings = BusSettings::default();
        apply_overrides_with(
            &mut settings,
            lookup_from(&[
                ("MIGHTYPIE_NATS_MAX_RETRIES", "3"),
                ("MIGHTYPIE_NATS_RETRY_DELAY_MS", "250"),
                ("MIGHTYPIE_STREAM_ENSURE", "yes"),
            ]),
        );
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.delay_ms, 250);
        assert!(settings.stream.ensure_on_connect);
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "No", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("perhaps"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u32_range("15", 1, 1000), Some(15));
        assert_eq!(parse_u32_range("0", 1, 1000), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }
}
