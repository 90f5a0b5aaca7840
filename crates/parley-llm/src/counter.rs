use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;

use parley_core::credentials::CredentialSlot;
use parley_core::history::ContentPart;
use parley_core::tokens::{TokenCountError, TokenCounter};

use crate::converter;

const COUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Token counts from the provider's `countTokens` endpoint. Always uses one
/// fixed slot; counting is cheap and not worth rotating for.
pub struct RemoteTokenCounter {
    client: Client,
    base_url: String,
    slot: CredentialSlot,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountResponse {
    total_tokens: Option<u32>,
}

impl RemoteTokenCounter {
    pub fn new(client: Client, base_url: impl Into<String>, slot: CredentialSlot) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            slot,
        }
    }

    fn count_url(&self) -> String {
        format!("{}/models/{}:countTokens", self.base_url, self.slot.model)
    }
}

#[async_trait]
impl TokenCounter for RemoteTokenCounter {
    async fn count_tokens(&self, parts: &[ContentPart]) -> Result<u32, TokenCountError> {
        let resp = self
            .client
            .post(self.count_url())
            .timeout(COUNT_TIMEOUT)
            .header("x-goog-api-key", self.slot.credential.0.expose_secret())
            .json(&converter::build_count_body(parts))
            .send()
            .await
            .map_err(|e| TokenCountError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TokenCountError::Request(format!("status {}", resp.status())));
        }

        let body: CountResponse = resp
            .json()
            .await
            .map_err(|e| TokenCountError::InvalidResponse(e.to_string()))?;

        body.total_tokens
            .ok_or_else(|| TokenCountError::InvalidResponse("missing totalTokens".into()))
    }
}
