//! Model provider and credential rotation settings.

use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// API base URL.
    pub base_url: String,
    /// Models in fallback order. Each is paired with every API key.
    pub models: Vec<String>,
    /// API keys in rotation order. Never written back out.
    #[serde(skip_serializing)]
    pub api_keys: Vec<String>,
    /// Cooldown applied to a slot after a rate limit without `Retry-After`.
    pub cooldown_ms: u64,
    /// Retries on the same slot for transient failures.
    pub max_transient_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Abort a stream that goes silent for this long.
    pub stream_idle_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            models: vec!["gemini-2.0-flash".to_string()],
            api_keys: Vec::new(),
            cooldown_ms: 60_000,
            max_transient_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            stream_idle_timeout_ms: 30_000,
            system_instruction: None,
            temperature: None,
            max_output_tokens: None,
        }
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .field("api_keys", &format_args!("[{} redacted]", self.api_keys.len()))
            .field("cooldown_ms", &self.cooldown_ms)
            .finish_non_exhaustive()
    }
}
