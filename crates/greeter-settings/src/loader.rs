//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GreeterSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `GREETER_*` environment variable overrides (highest priority)
//! 4. [`GreeterSettings::validate`]

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::GreeterSettings;

/// Resolve the default settings path (`~/.greeter/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".greeter").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GreeterSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid combination
/// of values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GreeterSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<GreeterSettings> {
    let defaults = serde_json::to_value(GreeterSettings::default())?;

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
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value
/// stays in effect.
pub fn apply_env_overrides(settings: &mut GreeterSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("GREETER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("GREETER_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Routing ─────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("GREETER_RNA_TIMEOUT_MS", 1000, 600_000) {
        settings.routing.rna_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("GREETER_DISCONNECT_GRACE_MS", 0, 600_000) {
        settings.routing.disconnect_grace_ms = v;
    }
    if let Some(v) = read_env_u64("GREETER_STALE_THRESHOLD_MS", 1000, 3_600_000) {
        settings.routing.stale_threshold_ms = v;
    }
    if let Some(v) = read_env_u64("GREETER_SWEEP_INTERVAL_MS", 1000, 3_600_000) {
        settings.routing.staleness_sweep_interval_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("GREETER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("GREETER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use serde_json::json;

    #[test]
    fn merge_nested_override() {
        let target = json!({"server": {"port": 8080, "host": "localhost"}});
        let source = json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1, "b": 2}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(json!({"items": [1, 2, 3]}), json!({"items": [4]}));
        assert_eq!(merged["items"], json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let merged = deep_merge(json!({"a": {"nested": true}}), json!({"a": 42}));
        assert_eq!(merged["a"], 42);
    }

    #[test]
    fn file_layer_missing_file_returns_defaults() {
        let settings = read_file_layer(Path::new("/nonexistent/greeter.json")).unwrap();
        assert_eq!(settings, GreeterSettings::default());
    }

    #[test]
    fn file_layer_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9001}, "routing": {"rnaTimeoutMs": 5000}}"#,
        )
        .unwrap();

        let settings = read_file_layer(&path).unwrap();
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.routing.rna_timeout_ms, 5000);
        assert_eq!(settings.routing.disconnect_grace_ms, 10_000);
    }

    #[test]
    fn file_layer_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(read_file_layer(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn load_rejects_invalid_combination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"heartbeatIntervalSecs": 60, "heartbeatTimeoutSecs": 10}}"#,
        )
        .unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn settings_path_ends_with_greeter_dir() {
        let path = settings_path();
        assert!(path.ends_with(".greeter/settings.json"));
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "TRUE", "1", "yes", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("abc", 1, 65535), None);
        assert_eq!(parse_u64_range("20000", 1000, 600_000), Some(20_000));
        assert_eq!(parse_u64_range("999", 1000, 600_000), None);
    }
}
