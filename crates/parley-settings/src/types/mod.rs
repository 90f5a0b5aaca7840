//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a partial JSON file only needs the keys it changes.

mod pipeline;
mod provider;
mod server;

pub use pipeline::*;
pub use provider::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// Loaded from `~/.parley/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values. Example:
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "ingest": { "debounceMs": 2000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Settings schema version.
    pub version: String,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub ingest: IngestSettings,
    pub dispatch: DispatchSettings,
    pub history: HistorySettings,
    pub tools: ToolSettings,
    pub provider: ProviderSettings,
}

impl Default for ParleySettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
            ingest: IngestSettings::default(),
            dispatch: DispatchSettings::default(),
            history: HistorySettings::default(),
            tools: ToolSettings::default(),
            provider: ProviderSettings::default(),
        }
    }
}

impl ParleySettings {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.debounce_ms == 0 {
            return Err(SettingsError::InvalidValue("ingest.debounceMs must be > 0".into()));
        }
        if self.ingest.typing_refresh_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "ingest.typingRefreshMs must be > 0".into(),
            ));
        }
        if self.ingest.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "ingest.sweepIntervalMs must be > 0".into(),
            ));
        }
        if self.dispatch.send_pacing_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "dispatch.sendPacingMs must be > 0".into(),
            ));
        }
        if self.tools.max_rounds == 0 {
            return Err(SettingsError::InvalidValue("tools.maxRounds must be > 0".into()));
        }
        if self.provider.models.is_empty() {
            return Err(SettingsError::InvalidValue(
                "provider.models must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ParleySettings::default().validate().unwrap();
    }

    #[test]
    fn zero_debounce_rejected() {
        let mut s = ParleySettings::default();
        s.ingest.debounce_ms = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn zero_sweep_interval_rejected() {
        let mut s = ParleySettings::default();
        s.ingest.sweep_interval_ms = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("sweepIntervalMs"), "{err}");
    }

    #[test]
    fn zero_pacing_rejected() {
        let mut s = ParleySettings::default();
        s.dispatch.send_pacing_ms = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("sendPacingMs"));
    }

    #[test]
    fn empty_models_rejected() {
        let mut s = ParleySettings::default();
        s.provider.models.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn camel_case_json() {
        let json = serde_json::to_value(ParleySettings::default()).unwrap();
        assert!(json["ingest"]["debounceMs"].is_u64());
        assert!(json["dispatch"]["sendPacingMs"].is_u64());
        assert!(json["history"]["tokenBudget"].is_u64());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: ParleySettings =
            serde_json::from_str(r#"{"tools": {"maxRounds": 5}}"#).unwrap();
        assert_eq!(s.tools.max_rounds, 5);
        assert_eq!(s.tools.timeout_ms, ToolSettings::default().timeout_ms);
        assert_eq!(s.server.port, ServerSettings::default().port);
    }
}
