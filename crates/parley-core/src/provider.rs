use async_trait::async_trait;

use crate::context::LlmRequest;
use crate::credentials::CredentialSlot;
use crate::errors::GatewayError;
use crate::stream::ChunkStream;

/// Trait implemented by each model backend. A provider performs exactly one
/// attempt with the slot it is given; rotation and retry live above it.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(
        &self,
        slot: &CredentialSlot,
        request: &LlmRequest,
    ) -> Result<ChunkStream, GatewayError>;
}
