use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::events::MessageRef;
use crate::ids::ThreadId;

/// Message to deliver, optionally as a reply to an earlier one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<MessageRef>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quote: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport rejected action: {0}")]
    Rejected(String),
}

/// Outbound side of the messaging platform.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        thread: &ThreadId,
        message: OutboundMessage,
    ) -> Result<MessageRef, TransportError>;

    async fn react(
        &self,
        thread: &ThreadId,
        reaction: &str,
        target: &MessageRef,
    ) -> Result<(), TransportError>;

    async fn send_sticker(
        &self,
        thread: &ThreadId,
        sticker: &str,
    ) -> Result<MessageRef, TransportError>;

    async fn undo(&self, thread: &ThreadId, target: &MessageRef) -> Result<(), TransportError>;

    /// Typing/presence indicator. Best effort.
    async fn typing(&self, thread: &ThreadId) -> Result<(), TransportError>;
}
