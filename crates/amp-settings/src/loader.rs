//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `AMP_*` environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use amp_core::ProtocolVersion;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ClientSettings, GiveUpPolicy};

/// Resolve the settings file: `$AMP_SETTINGS`, else `~/.amp/client.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("AMP_SETTINGS").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".amp").join("client.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply `AMP_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` (an env var reader in production).
///
/// Invalid values are logged and ignored.
pub fn apply_overrides_from(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Endpoints ───────────────────────────────────────────────────
    if let Some(v) = env.string("AMP_SOCKET_URL") {
        settings.socket_url = v;
    }
    if let Some(v) = env.string("AMP_POLLING_URL") {
        settings.polling_url = v;
    }
    if let Some(v) = env.string("AMP_DIAGNOSTICS_URL") {
        settings.diagnostics_url = Some(v);
    }

    // ── Behaviour ───────────────────────────────────────────────────
    if let Some(v) = env.parsed("AMP_PROTOCOL", parse_protocol) {
        settings.protocol = v;
    }
    if let Some(v) = env.parsed("AMP_FORCE_POLLING", parse_bool) {
        settings.force_polling = v;
    }
    if let Some(v) = env.parsed("AMP_TRACK_CHANGES", parse_bool) {
        settings.track_changes = v;
    }
    if let Some(v) = env.parsed("AMP_REQUEST_TIMEOUT_MS", |s| parse_u64_range(s, 0, 3_600_000)) {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = env.string("AMP_LOG_LEVEL") {
        settings.log_level = v;
    }

    // ── Reconnect give-up ───────────────────────────────────────────
    if let Some(v) = env.parsed("AMP_GIVE_UP_POLICY", parse_give_up_policy) {
        settings.socket.give_up.policy = v;
    }
    if let Some(v) = env.parsed("AMP_GIVE_UP_AFTER", |s| parse_u32_range(s, 1, 1_000_000)) {
        settings.socket.give_up.after_attempts = v;
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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse `v1`/`v2` (also `1`/`2`).
pub fn parse_protocol(val: &str) -> Option<ProtocolVersion> {
    match val.to_lowercase().as_str() {
        "v1" | "1" => Some(ProtocolVersion::V1),
        "v2" | "2" => Some(ProtocolVersion::V2),
        _ => None,
    }
}

/// Parse `never`/`stop`/`notify`.
pub fn parse_give_up_policy(val: &str) -> Option<GiveUpPolicy> {
    match val.to_lowercase().as_str() {
        "never" => Some(GiveUpPolicy::Never),
        "stop" => Some(GiveUpPolicy::Stop),
        "notify" => Some(GiveUpPolicy::Notify),
        _ => None,
    }
}

// ── Override reader ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;
    use assert_matches::assert_matches;

    fn overrides(pairs: &[(&str, &str)]) -> ClientSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = ClientSettings::default();
        apply_overrides_from(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"socket": {"pingIntervalMs": 4000, "reconnectCap": 12}});
        let source = serde_json::json!({"socket": {"pingIntervalMs": 1000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["socket"]["pingIntervalMs"], 1000);
        assert_eq!(merged["socket"]["reconnectCap"], 12);
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn read_missing_file_returns_defaults() {
        let settings = read_file_layer(Path::new("/nonexistent/client.json")).unwrap();
        assert_eq!(settings.socket_url, ClientSettings::default().socket_url);
        assert_eq!(settings.socket.reconnect_cap, 12);
    }

    #[test]
    fn read_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(
            &path,
            r#"{"protocol": "v1", "forcePolling": true, "socket": {"giveUp": {"policy": "stop"}}}"#,
        )
        .unwrap();

        let settings = read_file_layer(&path).unwrap();
        assert_eq!(settings.protocol, ProtocolVersion::V1);
        assert!(settings.force_polling);
        assert_eq!(settings.socket.give_up.policy, GiveUpPolicy::Stop);
        assert_eq!(settings.socket.give_up.after_attempts, 10);
        assert_eq!(settings.socket.ping_interval_ms, 4_000);
    }

    #[test]
    fn read_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, "not valid json").unwrap();

        assert_matches!(read_file_layer(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_merged_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"socket": {"reconnectCap": 99}}"#).unwrap();

        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        );
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let settings = overrides(&[
            ("AMP_SOCKET_URL", "wss://example.com/api"),
            ("AMP_PROTOCOL", "v1"),
            ("AMP_FORCE_POLLING", "yes"),
            ("AMP_TRACK_CHANGES", "off"),
            ("AMP_REQUEST_TIMEOUT_MS", "0"),
            ("AMP_GIVE_UP_POLICY", "notify"),
            ("AMP_GIVE_UP_AFTER", "3"),
            ("AMP_DIAGNOSTICS_URL", "http://127.0.0.1:9/log"),
        ]);
        assert_eq!(settings.socket_url, "wss://example.com/api");
        assert_eq!(settings.protocol, ProtocolVersion::V1);
        assert!(settings.force_polling);
        assert!(!settings.track_changes);
        assert!(settings.request_timeout().is_none());
        assert_eq!(settings.socket.give_up.policy, GiveUpPolicy::Notify);
        assert_eq!(settings.socket.give_up.after_attempts, 3);
        assert_eq!(settings.diagnostics_url.as_deref(), Some("http://127.0.0.1:9/log"));
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let settings = overrides(&[
            ("AMP_PROTOCOL", "v3"),
            ("AMP_FORCE_POLLING", "maybe"),
            ("AMP_GIVE_UP_AFTER", "0"),
            ("AMP_SOCKET_URL", ""),
        ]);
        let defaults = ClientSettings::default();
        assert_eq!(settings.protocol, defaults.protocol);
        assert!(!settings.force_polling);
        assert_eq!(settings.socket.give_up.after_attempts, 10);
        assert_eq!(settings.socket_url, defaults.socket_url);
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u32_range("-1", 0, 10), None);
    }

    #[test]
    fn parse_protocol_and_policy() {
        assert_eq!(parse_protocol("V2"), Some(ProtocolVersion::V2));
        assert_eq!(parse_protocol("1"), Some(ProtocolVersion::V1));
        assert_eq!(parse_give_up_policy("Stop"), Some(GiveUpPolicy::Stop));
        assert_eq!(parse_give_up_policy("later"), None);
    }
}
