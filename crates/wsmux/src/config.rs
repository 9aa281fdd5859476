//! Session configuration with file and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with [`SessionConfig::default()`]
//! 2. If a JSON config file is given and exists, deep-merge its values over defaults
//! 3. Apply `WSMUX_*` environment variable overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default keep-alive ping interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 30_000;
/// Default deadline for the peer to acknowledge an opened stream.
pub const DEFAULT_STREAM_ACCEPT_DEADLINE_MS: u64 = 30_000;
/// Default bound of the acceptor queue.
pub const DEFAULT_ACCEPT_QUEUE_SIZE: usize = 20;
/// Default credit granted to the peer of a new stream.
pub const DEFAULT_CAPACITY: u32 = 128 * 1024;
/// Default upper bound of one DAT payload.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 32 * 1024;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A config value was invalid.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Tunables for one [`Session`](crate::Session).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between transport pings in milliseconds; `0` disables pings.
    pub keep_alive_interval_ms: u64,
    /// How long `open` waits for the peer's ACK, in milliseconds.
    pub stream_accept_deadline_ms: u64,
    /// Bound of the queue of accepted streams awaiting `accept`.
    pub accept_queue_size: usize,
    /// Credit granted to the peer when a stream is created.
    pub initial_capacity: u32,
    /// Largest DAT payload sent in one transport message.
    pub max_frame_payload: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            stream_accept_deadline_ms: DEFAULT_STREAM_ACCEPT_DEADLINE_MS,
            accept_queue_size: DEFAULT_ACCEPT_QUEUE_SIZE,
            initial_capacity: DEFAULT_CAPACITY,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
        }
    }
}

impl SessionConfig {
    /// Replace zero deadline, capacity and payload values with their defaults.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.stream_accept_deadline_ms == 0 {
            self.stream_accept_deadline_ms = DEFAULT_STREAM_ACCEPT_DEADLINE_MS;
        }
        if self.initial_capacity == 0 {
            self.initial_capacity = DEFAULT_CAPACITY;
        }
        if self.max_frame_payload == 0 {
            self.max_frame_payload = DEFAULT_MAX_FRAME_PAYLOAD;
        }
        self
    }

    /// Keep-alive interval, `None` when pings are disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    /// Deadline for `open`.
    pub fn stream_accept_deadline(&self) -> Duration {
        Duration::from_millis(self.stream_accept_deadline_ms)
    }

    /// Reject configurations no session can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_payload > u32::MAX as usize {
            return Err(ConfigError::InvalidValue(format!(
                "max_frame_payload {} exceeds u32::MAX",
                self.max_frame_payload
            )));
        }
        Ok(())
    }
}

/// Load configuration from an optional JSON file with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<SessionConfig, ConfigError> {
    let defaults = serde_json::to_value(SessionConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading session config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: SessionConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config.normalized())
}

/// Lay a session config `file` over the serialized `defaults`, so a file may
/// set only the fields it cares about.
///
/// Nested objects merge key by key. A `null` in the file leaves the default in
/// place; any other value replaces it.
pub fn deep_merge(defaults: Value, file: Value) -> Value {
    match (defaults, file) {
        (Value::Object(mut merged), Value::Object(overrides)) => {
            for (key, value) in overrides.into_iter().filter(|(_, v)| !v.is_null()) {
                let value = match merged.remove(&key) {
                    Some(default) => deep_merge(default, value),
                    None => value,
                };
                let _ = merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, file) => file,
    }
}

/// Apply `WSMUX_*` environment variable overrides.
///
/// Values outside their accepted range are ignored with a warning.
pub fn apply_env_overrides(config: &mut SessionConfig) {
    if let Some(v) = read_env_u64("WSMUX_KEEP_ALIVE_MS", 0, 3_600_000) {
        config.keep_alive_interval_ms = v;
    }
    if let Some(v) = read_env_u64("WSMUX_ACCEPT_DEADLINE_MS", 1, 3_600_000) {
        config.stream_accept_deadline_ms = v;
    }
    if let Some(v) = read_env_u64("WSMUX_ACCEPT_QUEUE", 0, 65_536) {
        config.accept_queue_size = usize::try_from(v).unwrap_or(DEFAULT_ACCEPT_QUEUE_SIZE);
    }
    if let Some(v) = read_env_u64("WSMUX_INITIAL_CAPACITY", 1, u64::from(u32::MAX)) {
        config.initial_capacity = u32::try_from(v).unwrap_or(DEFAULT_CAPACITY);
    }
    if let Some(v) = read_env_u64("WSMUX_MAX_FRAME_PAYLOAD", 1, 16 * 1024 * 1024) {
        config.max_frame_payload = usize::try_from(v).unwrap_or(DEFAULT_MAX_FRAME_PAYLOAD);
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.keep_alive_interval_ms, 30_000);
        assert_eq!(cfg.stream_accept_deadline_ms, 30_000);
        assert_eq!(cfg.accept_queue_size, 20);
        assert_eq!(cfg.initial_capacity, DEFAULT_CAPACITY);
        assert_eq!(cfg.max_frame_payload, DEFAULT_MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn normalized_replaces_zeroes() {
        let cfg = SessionConfig {
            keep_alive_interval_ms: 0,
            stream_accept_deadline_ms: 0,
            accept_queue_size: 0,
            initial_capacity: 0,
            max_frame_payload: 0,
        }
        .normalized();
        assert_eq!(cfg.stream_accept_deadline_ms, DEFAULT_STREAM_ACCEPT_DEADLINE_MS);
        assert_eq!(cfg.initial_capacity, DEFAULT_CAPACITY);
        assert_eq!(cfg.max_frame_payload, DEFAULT_MAX_FRAME_PAYLOAD);
        // Zero keeps its meaning for these two.
        assert_eq!(cfg.keep_alive_interval_ms, 0);
        assert_eq!(cfg.accept_queue_size, 0);
    }

    #[test]
    fn zero_keep_alive_disables_pings() {
        let cfg = SessionConfig {
            keep_alive_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert!(cfg.keep_alive_interval().is_none());
        assert_eq!(
            SessionConfig::default().keep_alive_interval(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: SessionConfig = serde_json::from_str(r#"{"accept_queue_size":3}"#).unwrap();
        assert_eq!(cfg.accept_queue_size, 3);
        assert_eq!(cfg.stream_accept_deadline_ms, 30_000);
    }

    #[test]
    fn merge_simple_override() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": 10, "b": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 10);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_u64_range("50", 1, 100), Some(50));
        assert_eq!(parse_u64_range(" 7 ", 1, 100), Some(7));
        assert_eq!(parse_u64_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("abc", 1, 100), None);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(cfg.accept_queue_size, SessionConfig::default().accept_queue_size);
    }

    #[test]
    fn load_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"stream_accept_deadline_ms": 250, "initial_capacity": 64}}"#).unwrap();
        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.stream_accept_deadline_ms, 250);
        assert_eq!(cfg.initial_capacity, 64);
        assert_eq!(cfg.keep_alive_interval_ms, DEFAULT_KEEP_ALIVE_INTERVAL_MS);
    }

    #[test]
    fn load_invalid_json_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn validate_rejects_oversized_payload() {
        let cfg = SessionConfig {
            max_frame_payload: usize::MAX,
            ..SessionConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue(_))));
    }
}
