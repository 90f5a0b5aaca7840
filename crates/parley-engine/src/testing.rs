//! In-memory [`Transport`] that records every side effect, for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use parley_core::events::{Batch, ClassifiedEvent, EventBody, MessageRef};
use parley_core::ids::ThreadId;
use parley_core::transport::{OutboundMessage, Transport, TransportError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportAction {
    Send {
        text: String,
        quote: Option<MessageRef>,
        sent: MessageRef,
    },
    React {
        reaction: String,
        target: MessageRef,
    },
    Sticker {
        sticker: String,
    },
    Undo {
        target: MessageRef,
    },
    Typing,
}

#[derive(Clone, Debug)]
pub struct Recorded {
    pub thread_id: ThreadId,
    pub action: TransportAction,
    pub at: Instant,
}

#[derive(Default)]
pub struct RecordingTransport {
    log: Mutex<Vec<Recorded>>,
    next_id: AtomicU64,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `send` fail until switched back.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    /// Everything except typing indicators.
    pub fn actions(&self) -> Vec<TransportAction> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.action != TransportAction::Typing)
            .map(|r| r.action.clone())
            .collect()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match &r.action {
                TransportAction::Send { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn typing_count(&self, thread_id: &ThreadId) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| &r.thread_id == thread_id && r.action == TransportAction::Typing)
            .count()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    fn record(&self, thread_id: &ThreadId, action: TransportAction) {
        self.log.lock().push(Recorded {
            thread_id: thread_id.clone(),
            action,
            at: Instant::now(),
        });
    }

    fn next_ref(&self) -> MessageRef {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        MessageRef {
            msg_id: format!("out-{n}"),
            cli_msg_id: Some(format!("cli-{n}")),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        thread: &ThreadId,
        message: OutboundMessage,
    ) -> Result<MessageRef, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Request("send disabled".into()));
        }
        let sent = self.next_ref();
        self.record(
            thread,
            TransportAction::Send {
                text: message.text,
                quote: message.quote,
                sent: sent.clone(),
            },
        );
        Ok(sent)
    }

    async fn react(
        &self,
        thread: &ThreadId,
        reaction: &str,
        target: &MessageRef,
    ) -> Result<(), TransportError> {
        self.record(
            thread,
            TransportAction::React {
                reaction: reaction.to_string(),
                target: target.clone(),
            },
        );
        Ok(())
    }

    async fn send_sticker(
        &self,
        thread: &ThreadId,
        sticker: &str,
    ) -> Result<MessageRef, TransportError> {
        self.record(
            thread,
            TransportAction::Sticker {
                sticker: sticker.to_string(),
            },
        );
        Ok(self.next_ref())
    }

    async fn undo(&self, thread: &ThreadId, target: &MessageRef) -> Result<(), TransportError> {
        self.record(
            thread,
            TransportAction::Undo {
                target: target.clone(),
            },
        );
        Ok(())
    }

    async fn typing(&self, thread: &ThreadId) -> Result<(), TransportError> {
        self.record(thread, TransportAction::Typing);
        Ok(())
    }
}

/// Batch of plain text events; each pair is `(msg_id, text)`.
pub fn text_batch(thread_id: &ThreadId, messages: &[(&str, &str)]) -> Batch {
    Batch {
        thread_id: thread_id.clone(),
        events: messages
            .iter()
            .map(|(msg_id, text)| ClassifiedEvent {
                message: MessageRef::new(*msg_id),
                sender_id: "user".into(),
                sender_name: None,
                timestamp: Utc::now(),
                body: EventBody::Text {
                    text: (*text).to_string(),
                },
            })
            .collect(),
    }
}
