use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use parley_core::events::MessageRef;
use parley_core::ids::ThreadId;
use parley_core::transport::{OutboundMessage, Transport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Body POSTed to the webhook, tagged by `action`.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WebhookAction<'a> {
    #[serde(rename_all = "camelCase")]
    Send {
        thread_id: &'a ThreadId,
        text: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        quote: Option<&'a MessageRef>,
    },
    #[serde(rename_all = "camelCase")]
    React {
        thread_id: &'a ThreadId,
        reaction: &'a str,
        target: &'a MessageRef,
    },
    #[serde(rename_all = "camelCase")]
    Sticker {
        thread_id: &'a ThreadId,
        sticker: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    Undo {
        thread_id: &'a ThreadId,
        target: &'a MessageRef,
    },
    #[serde(rename_all = "camelCase")]
    Typing { thread_id: &'a ThreadId },
}

impl WebhookAction<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::React { .. } => "react",
            Self::Sticker { .. } => "sticker",
            Self::Undo { .. } => "undo",
            Self::Typing { .. } => "typing",
        }
    }
}

/// Platform ids returned for delivered messages.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Delivered {
    msg_id: String,
    #[serde(default)]
    cli_msg_id: Option<String>,
}

/// Delivers every outbound action as a JSON POST to one URL. The platform
/// bridge behind it answers sends with the ids of the delivered message.
pub struct WebhookTransport {
    client: Client,
    url: String,
    timeout: Duration,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, action: &WebhookAction<'_>) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(action)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!(
                "{} returned {status}: {}",
                action.name(),
                body.trim()
            )));
        }
        Ok(resp)
    }

    async fn post_delivery(&self, action: &WebhookAction<'_>) -> Result<MessageRef, TransportError> {
        let resp = self.post(action).await?;
        let delivered: Delivered = resp.json().await.map_err(|e| {
            TransportError::Rejected(format!("{} response missing message ids: {e}", action.name()))
        })?;
        Ok(MessageRef {
            msg_id: delivered.msg_id,
            cli_msg_id: delivered.cli_msg_id,
        })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn send(
        &self,
        thread: &ThreadId,
        message: OutboundMessage,
    ) -> Result<MessageRef, TransportError> {
        self.post_delivery(&WebhookAction::Send {
            thread_id: thread,
            text: &message.text,
            quote: message.quote.as_ref(),
        })
        .await
    }

    async fn react(
        &self,
        thread: &ThreadId,
        reaction: &str,
        target: &MessageRef,
    ) -> Result<(), TransportError> {
        self.post(&WebhookAction::React {
            thread_id: thread,
            reaction,
            target,
        })
        .await
        .map(drop)
    }

    async fn send_sticker(
        &self,
        thread: &ThreadId,
        sticker: &str,
    ) -> Result<MessageRef, TransportError> {
        self.post_delivery(&WebhookAction::Sticker {
            thread_id: thread,
            sticker,
        })
        .await
    }

    async fn undo(&self, thread: &ThreadId, target: &MessageRef) -> Result<(), TransportError> {
        self.post(&WebhookAction::Undo {
            thread_id: thread,
            target,
        })
        .await
        .map(drop)
    }

    async fn typing(&self, thread: &ThreadId) -> Result<(), TransportError> {
        if let Err(e) = self.post(&WebhookAction::Typing { thread_id: thread }).await {
            debug!(thread_id = %thread, error = %e, "typing indicator failed");
        }
        Ok(())
    }
}

/// Used when no webhook is configured: every action is logged and sends
/// get locally minted ids.
#[derive(Debug, Default)]
pub struct LoggingTransport {
    next_id: AtomicU64,
}

impl LoggingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&self) -> MessageRef {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        MessageRef::new(format!("local-{n}"))
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn send(
        &self,
        thread: &ThreadId,
        message: OutboundMessage,
    ) -> Result<MessageRef, TransportError> {
        let sent = self.mint();
        info!(
            thread_id = %thread,
            msg_id = %sent.msg_id,
            quote = ?message.quote.as_ref().map(|q| q.msg_id.as_str()),
            text = %message.text,
            "send"
        );
        Ok(sent)
    }

    async fn react(
        &self,
        thread: &ThreadId,
        reaction: &str,
        target: &MessageRef,
    ) -> Result<(), TransportError> {
        info!(thread_id = %thread, reaction, target = %target.msg_id, "react");
        Ok(())
    }

    async fn send_sticker(
        &self,
        thread: &ThreadId,
        sticker: &str,
    ) -> Result<MessageRef, TransportError> {
        let sent = self.mint();
        info!(thread_id = %thread, msg_id = %sent.msg_id, sticker, "sticker");
        Ok(sent)
    }

    async fn undo(&self, thread: &ThreadId, target: &MessageRef) -> Result<(), TransportError> {
        warn!(thread_id = %thread, target = %target.msg_id, "undo");
        Ok(())
    }

    async fn typing(&self, thread: &ThreadId) -> Result<(), TransportError> {
        debug!(thread_id = %thread, "typing");
        Ok(())
    }
}
