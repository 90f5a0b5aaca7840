//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `PARLEY_*` environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ParleySettings;

/// Parley's home directory (`~/.parley`).
pub fn parley_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

/// Resolve the path to the settings file (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    parley_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, no env overrides.
fn read_layered(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

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

/// Apply environment variable overrides to loaded settings.
///
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Lists are comma separated, blanks dropped
/// - Invalid values are ignored with a warning (fall back to file/default)
pub fn apply_env_overrides(settings: &mut ParleySettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("PARLEY_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("PARLEY_WEBHOOK_URL") {
        settings.server.webhook_url = Some(v);
    }
    if let Some(v) = read_env_string("PARLEY_DB_PATH") {
        settings.server.db_path = v;
    }
    if let Some(v) = read_env_string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("PARLEY_PERSIST_WARNINGS") {
        settings.logging.persist_warnings = v;
    }

    // ── Pipeline ────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("PARLEY_DEBOUNCE_MS", 1, 60_000) {
        settings.ingest.debounce_ms = v;
    }
    if let Some(v) = read_env_u64("PARLEY_TYPING_REFRESH_MS", 100, 60_000) {
        settings.ingest.typing_refresh_ms = v;
    }
    if let Some(v) = read_env_u64("PARLEY_IDLE_EVICT_MS", 1_000, 86_400_000) {
        settings.ingest.idle_evict_after_ms = v;
    }
    if let Some(v) = read_env_u64("PARLEY_SWEEP_INTERVAL_MS", 1_000, 86_400_000) {
        settings.ingest.sweep_interval_ms = v;
    }
    if let Some(v) = read_env_u64("PARLEY_SEND_PACING_MS", 1, 10_000) {
        settings.dispatch.send_pacing_ms = v;
    }
    if let Some(v) = read_env_string("PARLEY_APOLOGY") {
        settings.dispatch.apology_message = v;
    }
    if let Some(v) = read_env_u32("PARLEY_HISTORY_BUDGET", 64, 2_000_000) {
        settings.history.token_budget = v;
    }
    if let Some(v) = read_env_u32("PARLEY_MAX_TOOL_ROUNDS", 1, 16) {
        settings.tools.max_rounds = v;
    }
    if let Some(v) = read_env_u64("PARLEY_TOOL_TIMEOUT_MS", 100, 600_000) {
        settings.tools.timeout_ms = v;
    }

    // ── Provider ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PARLEY_BASE_URL") {
        settings.provider.base_url = v;
    }
    if let Some(v) = read_env_list("PARLEY_API_KEYS") {
        settings.provider.api_keys = v;
    }
    if let Some(v) = read_env_list("PARLEY_MODELS") {
        settings.provider.models = v;
    }
    if let Some(v) = read_env_u64("PARLEY_COOLDOWN_MS", 1_000, 86_400_000) {
        settings.provider.cooldown_ms = v;
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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
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

/// Split a comma separated list, trimming entries and dropping blanks.
pub fn parse_list(val: &str) -> Option<Vec<String>> {
    let items: Vec<String> = val
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_list(name: &str) -> Option<Vec<String>> {
    let val = std::env::var(name).ok()?;
    let result = parse_list(&val);
    if result.is_none() {
        tracing::warn!(key = name, "empty list env var, ignoring");
    }
    result
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

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
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
