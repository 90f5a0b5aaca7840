//! Raw inbound payload → typed [`EventBody`].
//!
//! Payload fields looked at (all optional):
//! `msgType`, `content` (string, or link card `{href,title,description}`),
//! `attachment` (`{url,mime,duration,size,name}`), `sticker` (`{id,url}`),
//! `quote` (`{msgId,content,attachment,msgType}`), `system` (`{action}`).

use serde_json::Value;

use parley_core::events::{
    ClassifiedEvent, EventBody, LinkPreview, MediaAttachment, MediaKind, QuotedContent,
    QuotedMedia, RawEvent,
};

/// Classify a raw event. Pure and total: shapes no rule recognises become
/// [`EventBody::Unknown`].
pub fn classify(raw: &RawEvent) -> ClassifiedEvent {
    ClassifiedEvent {
        message: raw.message.clone(),
        sender_id: raw.sender_id.clone(),
        sender_name: raw.sender_name.clone(),
        timestamp: raw.timestamp,
        body: classify_payload(&raw.payload),
    }
}

fn classify_payload(payload: &Value) -> EventBody {
    let hint = str_field(payload, "msgType").map(|s| s.to_ascii_lowercase());

    // Control events carry no user content, so they win over everything.
    if let Some(action) = payload.get("system").and_then(|s| str_field(s, "action")) {
        return EventBody::System { action };
    }

    if let Some(sticker) = payload.get("sticker").filter(|v| v.is_object()) {
        if let Some(sticker_id) = str_field(sticker, "id") {
            return EventBody::Sticker {
                sticker_id,
                url: str_field(sticker, "url"),
            };
        }
    }

    let text = payload
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some((kind, media)) = payload
        .get("attachment")
        .and_then(|a| attachment(a, hint.as_deref()))
    {
        let caption = text.filter(|t| !t.trim().is_empty());
        return match kind {
            MediaKind::Image => EventBody::Image { media, caption },
            MediaKind::Video => EventBody::Video { media, caption },
            MediaKind::Voice => EventBody::Voice { media },
            MediaKind::File | MediaKind::Sticker => EventBody::File { media },
        };
    }

    if let Some(card) = payload.get("content").filter(|v| v.is_object()) {
        if let Some(url) = str_field(card, "href") {
            return EventBody::Link {
                link: LinkPreview {
                    url,
                    title: str_field(card, "title"),
                    description: str_field(card, "description"),
                },
                text: str_field(card, "text"),
            };
        }
    }

    let quoted = payload.get("quote").filter(|v| v.is_object()).map(quoted_content);
    match (text, quoted) {
        (Some(text), Some(quoted)) => EventBody::Quote { text, quoted },
        (None, Some(quoted)) => EventBody::Quote {
            text: String::new(),
            quoted,
        },
        (Some(text), None) if !text.trim().is_empty() => EventBody::Text { text },
        _ => EventBody::Unknown {
            raw: payload.clone(),
        },
    }
}

/// Media kind from the `msgType` hint first, then from the mime type.
/// Attachments with neither are treated as files.
fn attachment(value: &Value, hint: Option<&str>) -> Option<(MediaKind, MediaAttachment)> {
    let url = str_field(value, "url")?;
    let mime = str_field(value, "mime");

    let kind = hint
        .and_then(kind_from_hint)
        .or_else(|| mime.as_deref().and_then(kind_from_mime))
        .unwrap_or(MediaKind::File);

    Some((
        kind,
        MediaAttachment {
            url,
            mime,
            duration_ms: value.get("duration").and_then(Value::as_u64),
            size: value.get("size").and_then(Value::as_u64),
            name: str_field(value, "name"),
        },
    ))
}

fn kind_from_hint(hint: &str) -> Option<MediaKind> {
    match hint {
        "image" | "photo" | "gif" => Some(MediaKind::Image),
        "video" => Some(MediaKind::Video),
        "voice" | "audio" => Some(MediaKind::Voice),
        "file" | "document" => Some(MediaKind::File),
        _ => None,
    }
}

fn kind_from_mime(mime: &str) -> Option<MediaKind> {
    let major = mime.split('/').next()?.to_ascii_lowercase();
    match major.as_str() {
        "image" => Some(MediaKind::Image),
        "video" => Some(MediaKind::Video),
        "audio" => Some(MediaKind::Voice),
        _ => None,
    }
}

fn quoted_content(quote: &Value) -> QuotedContent {
    let hint = str_field(quote, "msgType").map(|s| s.to_ascii_lowercase());
    QuotedContent {
        msg_id: str_field(quote, "msgId"),
        text: quote
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string),
        media: quote
            .get("attachment")
            .and_then(|a| attachment(a, hint.as_deref()))
            .map(|(kind, attachment)| QuotedMedia { kind, attachment }),
    }
}

/// String field that tolerates numeric ids.
fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
