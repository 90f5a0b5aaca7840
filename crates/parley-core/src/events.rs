use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ThreadId;

/// Platform identifiers of a delivered message. `cli_msg_id` is the
/// client-side id some transports need to target reactions and undo.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_msg_id: Option<String>,
}

impl MessageRef {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            cli_msg_id: None,
        }
    }
}

/// Inbound event as delivered by the messaging transport. The payload is
/// opaque until the classifier has looked at it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub thread_id: ThreadId,
    pub message: MessageRef,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Voice,
    File,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Voice => "voice",
            Self::File => "file",
            Self::Sticker => "sticker",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedMedia {
    pub kind: MediaKind,
    pub attachment: MediaAttachment,
}

/// Content of the message a user replied to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotedContent {
    #[serde(default)]
    pub msg_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<QuotedMedia>,
}

impl QuotedContent {
    pub fn plain_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Closed set of inbound event shapes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Text { text: String },
    Image { media: MediaAttachment, caption: Option<String> },
    Video { media: MediaAttachment, caption: Option<String> },
    Voice { media: MediaAttachment },
    File { media: MediaAttachment },
    Sticker { sticker_id: String, url: Option<String> },
    Link { link: LinkPreview, text: Option<String> },
    Quote { text: String, quoted: QuotedContent },
    System { action: String },
    /// Kept for diagnostics only. Never reaches the model.
    Unknown { raw: serde_json::Value },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Voice { .. } => "voice",
            Self::File { .. } => "file",
            Self::Sticker { .. } => "sticker",
            Self::Link { .. } => "link",
            Self::Quote { .. } => "quote",
            Self::System { .. } => "system",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Media carried by the event itself (not by a quoted message).
    pub fn media(&self) -> Option<(MediaKind, &MediaAttachment)> {
        match self {
            Self::Image { media, .. } => Some((MediaKind::Image, media)),
            Self::Video { media, .. } => Some((MediaKind::Video, media)),
            Self::Voice { media } => Some((MediaKind::Voice, media)),
            Self::File { media } => Some((MediaKind::File, media)),
            _ => None,
        }
    }

    pub fn is_media(&self) -> bool {
        self.media().is_some() || matches!(self, Self::Sticker { .. })
    }

    /// User-visible text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Quote { text, .. } => Some(text),
            Self::Image { caption, .. } | Self::Video { caption, .. } => caption.as_deref(),
            Self::Link { text, .. } => text.as_deref(),
            _ => None,
        }
    }

    pub fn quoted(&self) -> Option<&QuotedContent> {
        match self {
            Self::Quote { quoted, .. } => Some(quoted),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedEvent {
    pub message: MessageRef,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: EventBody,
}

/// Events flushed together after a quiet period, in arrival order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub thread_id: ThreadId,
    pub events: Vec<ClassifiedEvent>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// 1-based lookup used by directive targets.
    pub fn nth(&self, index: usize) -> Option<&ClassifiedEvent> {
        index.checked_sub(1).and_then(|i| self.events.get(i))
    }

    /// First quoted message in the batch, if any.
    pub fn quoted(&self) -> Option<&QuotedContent> {
        self.events.iter().find_map(|e| e.body.quoted())
    }

    pub fn last_message(&self) -> Option<&MessageRef> {
        self.events.last().map(|e| &e.message)
    }
}
