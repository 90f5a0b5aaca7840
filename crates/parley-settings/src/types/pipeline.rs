//! Per-thread pipeline tuning: ingestion, dispatch, history, tools.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestSettings {
    /// Quiet period before a thread's buffer is flushed as one batch.
    pub debounce_ms: u64,
    /// Typing indicator refresh interval while a buffer is open.
    pub typing_refresh_ms: u64,
    /// Thread state is dropped after this long without activity.
    pub idle_evict_after_ms: u64,
    /// How often the idle sweeper runs.
    pub sweep_interval_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 1_500,
            typing_refresh_ms: 4_000,
            idle_evict_after_ms: 1_800_000,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Delay between consecutive sends within one round.
    pub send_pacing_ms: u64,
    /// Sent once when every credential is exhausted or the provider fails hard.
    pub apology_message: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            send_pacing_ms: 800,
            apology_message: "Sorry, I can't answer right now. Please try again in a moment."
                .to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistorySettings {
    /// Token budget for history included in each request.
    pub token_budget: u32,
    /// Use the provider's token counting endpoint instead of the estimate.
    pub remote_token_count: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            token_budget: 8_000,
            remote_token_count: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    /// Extra generation rounds allowed for tool calls.
    pub max_rounds: u32,
    /// Per-call execution timeout.
    pub timeout_ms: u64,
    /// Tool output longer than this is truncated before entering history.
    pub max_output_chars: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            timeout_ms: 30_000,
            max_output_chars: 8_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_and_debounce_positive_by_default() {
        assert!(IngestSettings::default().debounce_ms > 0);
        assert!(DispatchSettings::default().send_pacing_ms > 0);
    }

    #[test]
    fn tool_settings_serde() {
        let json = serde_json::to_value(ToolSettings::default()).unwrap();
        assert_eq!(json["maxRounds"], 3);
        assert_eq!(json["maxOutputChars"], 8000);
    }
}
