use async_trait::async_trait;

use crate::history::ContentPart;

/// Fixed per-entry overhead added to every estimate (role marker, framing).
pub const ENTRY_OVERHEAD_TOKENS: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum TokenCountError {
    #[error("token count request failed: {0}")]
    Request(String),
    #[error("unexpected token count response: {0}")]
    InvalidResponse(String),
}

/// External token-counting capability.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count_tokens(&self, parts: &[ContentPart]) -> Result<u32, TokenCountError>;
}

/// Deterministic fallback: `ceil(chars / 4) + ENTRY_OVERHEAD_TOKENS`, where
/// chars covers text parts and media reference strings.
pub fn estimate_tokens(parts: &[ContentPart]) -> u32 {
    let chars: usize = parts.iter().map(ContentPart::char_len).sum();
    u32::try_from(chars.div_ceil(4))
        .unwrap_or(u32::MAX)
        .saturating_add(ENTRY_OVERHEAD_TOKENS)
}

/// Counter that never calls out. Used when no remote counter is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct EstimatingCounter;

#[async_trait]
impl TokenCounter for EstimatingCounter {
    async fn count_tokens(&self, parts: &[ContentPart]) -> Result<u32, TokenCountError> {
        Ok(estimate_tokens(parts))
    }
}

/// Ask `counter`, fall back to the estimate on failure.
pub async fn count_or_estimate(counter: &dyn TokenCounter, parts: &[ContentPart]) -> u32 {
    match counter.count_tokens(parts).await {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!(error = %e, "token counter failed, using estimate");
            estimate_tokens(parts)
        }
    }
}
