//! Config loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If the config file exists, deep-merge its values over defaults
//! 3. Apply `ARIA_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::errors::Result;

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "ARIA_CONFIG";

/// Resolve the config file path: `$ARIA_CONFIG`, else `./aria.json`.
pub fn config_path() -> PathBuf {
    read_env_string(CONFIG_PATH_ENV).map_or_else(|| PathBuf::from("aria.json"), PathBuf::from)
}

/// Load config from the default path with env var overrides.
pub fn load_config() -> Result<ServerConfig> {
    load_config_from_path(&config_path())
}

/// Load config from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig> {
    let mut config = load_file(path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load defaults merged with `path`, without env overrides.
pub fn load_file(path: &Path) -> Result<ServerConfig> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
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

/// Apply process environment overrides.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Lists are comma-separated; blank items are dropped
/// - Invalid values are ignored with a warning (fall back to file/default)
pub fn apply_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Listener ────────────────────────────────────────────────────
    if let Some(v) = env.string("ARIA_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u16("ARIA_PORT", 0, 65535) {
        config.port = v;
    }
    if let Some(v) = env.usize("ARIA_MAX_MESSAGE_SIZE", 1024, 1 << 30) {
        config.max_message_size = v;
    }
    if let Some(v) = env.usize("ARIA_MAX_FRAME_SIZE", 1024, 1 << 30) {
        config.max_frame_size = v;
    }
    if let Some(v) = env.u64("ARIA_SHUTDOWN_TIMEOUT_SECS", 0, 3600) {
        config.shutdown_timeout_secs = v;
    }
    if let Some(v) = env.u64("ARIA_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        config.handshake_timeout_ms = v;
    }
    if let Some(v) = env.u64("ARIA_PING_TIMEOUT_MS", 10, 600_000) {
        config.ping_timeout_ms = v;
    }

    // ── Handshake ───────────────────────────────────────────────────
    if let Some(v) = env.list("ARIA_SUBPROTOCOLS") {
        config.accept.subprotocols = v;
    }
    if let Some(v) = env.list("ARIA_ORIGIN_PATTERNS") {
        config.accept.origin_patterns = v;
    }
    if let Some(v) = env.bool("ARIA_INSECURE_SKIP_VERIFY") {
        config.accept.insecure_skip_verify = v;
    }
    if let Some(v) = env.string("ARIA_COMPRESSION_MODE") {
        match serde_json::from_value(Value::String(v.clone())) {
            Ok(mode) => config.accept.compression_mode = mode,
            Err(_) => tracing::warn!(key = "ARIA_COMPRESSION_MODE", value = %v, "invalid compression mode, ignoring"),
        }
    }
    if let Some(v) = env.usize("ARIA_COMPRESSION_THRESHOLD", 0, 1 << 30) {
        config.accept.compression_threshold = v;
    }
}

// ── Pure parsers ────────────────────────────────────────────────────────────

/// Parse a string as a boolean.
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

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, trimming items and dropping blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn list(&self, name: &str) -> Option<Vec<String>> {
        self.string(name).map(|v| parse_list(&v))
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
