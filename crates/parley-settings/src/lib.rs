//! # parley-settings
//!
//! Layered configuration for the Parley gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`ParleySettings::default()`])
//! 2. **User file**: `~/.parley/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `PARLEY_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, parley_home, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_values() {
        let settings = ParleySettings::default();
        assert_eq!(settings.version, "0.1.0");
        assert_eq!(settings.server.port, 8090);
        assert_eq!(settings.ingest.debounce_ms, 1_500);
        assert_eq!(settings.dispatch.send_pacing_ms, 800);
        assert_eq!(settings.history.token_budget, 8_000);
        assert_eq!(settings.tools.max_rounds, 3);
        assert!(settings.provider.api_keys.is_empty());
    }
}
