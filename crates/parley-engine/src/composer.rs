//! Batch → model input.
//!
//! Exactly one template applies, by priority: media in the batch, then a
//! quoted message that carries media, then links, then plain text.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use parley_core::events::{Batch, EventBody, MediaAttachment, MediaKind, QuotedContent};
use parley_core::history::ContentPart;

use crate::error::ComposeError;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"\]\)]+"#).expect("valid regex"));

static VIDEO_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://([a-z0-9-]+\.)*(youtube\.com|youtu\.be|tiktok\.com|vimeo\.com)(/|$|\?)")
        .expect("valid regex")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Media,
    QuoteMedia,
    Links,
    Plain,
}

/// Media reference forwarded to the model alongside the text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
    pub mime: Option<String>,
}

/// Rendered user turn for one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub template: TemplateKind,
    pub text: String,
    pub media: Vec<MediaRef>,
    pub annotations: Vec<String>,
}

impl Prompt {
    /// Text and annotations as one text part, then each media reference.
    pub fn to_parts(&self) -> Vec<ContentPart> {
        let mut text = self.text.clone();
        for note in &self.annotations {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(note);
        }
        let mut parts = vec![ContentPart::text(text)];
        parts.extend(self.media.iter().map(|m| ContentPart::Media {
            kind: m.kind,
            url: m.url.clone(),
            mime: m.mime.clone(),
        }));
        parts
    }
}

/// Build the prompt for a batch.
///
/// `quoted` is the message the user replied to, usually `batch.quoted()`.
/// `pending` holds output from an interrupted earlier round.
pub fn compose(
    batch: &Batch,
    quoted: Option<&QuotedContent>,
    pending: &[String],
) -> Result<Prompt, ComposeError> {
    let contentful = batch
        .events
        .iter()
        .any(|e| !matches!(e.body, EventBody::System { .. } | EventBody::Unknown { .. }));
    if !contentful {
        return Err(ComposeError::EmptyBatch);
    }

    let texts = batch_texts(batch);
    let quote_media = quoted.and_then(|q| q.media.as_ref());

    let mut prompt = if batch.events.iter().any(|e| e.body.is_media()) {
        media_template(batch, &texts)
    } else if let Some(qm) = quote_media {
        quote_media_template(qm.kind, &qm.attachment, &texts)
    } else {
        let links = collect_links(batch, &texts);
        if links.is_empty() {
            Prompt {
                template: TemplateKind::Plain,
                text: texts.join("\n"),
                media: Vec::new(),
                annotations: Vec::new(),
            }
        } else {
            links_template(&texts, &links)
        }
    };

    if prompt.template != TemplateKind::QuoteMedia {
        if let Some(text) = quoted.and_then(QuotedContent::plain_text) {
            prompt.annotations.push(format!("[Replying to: \"{}\"]", text.trim()));
        }
    }

    let fragments: Vec<&str> = pending
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if !fragments.is_empty() {
        prompt.annotations.push(format!(
            "[Your earlier reply was interrupted before it was sent: \"{}\"]",
            fragments.join(" ")
        ));
    }

    Ok(prompt)
}

fn batch_texts(batch: &Batch) -> Vec<String> {
    batch
        .events
        .iter()
        .filter_map(|e| e.body.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn media_template(batch: &Batch, texts: &[String]) -> Prompt {
    let mut lines = Vec::new();
    let mut media = Vec::new();

    for event in &batch.events {
        let item = match &event.body {
            EventBody::Sticker { sticker_id, url } => {
                if let Some(url) = url {
                    media.push(MediaRef {
                        kind: MediaKind::Sticker,
                        url: url.clone(),
                        mime: None,
                    });
                }
                format!("sticker id={sticker_id}")
            }
            body => match body.media() {
                Some((kind, attachment)) => {
                    media.push(MediaRef {
                        kind,
                        url: attachment.url.clone(),
                        mime: attachment.mime.clone(),
                    });
                    describe_media(kind, attachment)
                }
                None => continue,
            },
        };
        lines.push(format!("{}. {item}", lines.len() + 1));
    }

    let mut text = format!("The user sent {} attachment(s):\n{}", lines.len(), lines.join("\n"));
    if !texts.is_empty() {
        text.push_str("\n\nMessage:\n");
        text.push_str(&texts.join("\n"));
    }

    Prompt {
        template: TemplateKind::Media,
        text,
        media,
        annotations: Vec::new(),
    }
}

fn quote_media_template(kind: MediaKind, attachment: &MediaAttachment, texts: &[String]) -> Prompt {
    let mut text = format!(
        "The user is replying to an earlier {}.",
        describe_media(kind, attachment)
    );
    if !texts.is_empty() {
        text.push_str("\n\nMessage:\n");
        text.push_str(&texts.join("\n"));
    }
    Prompt {
        template: TemplateKind::QuoteMedia,
        text,
        media: vec![MediaRef {
            kind,
            url: attachment.url.clone(),
            mime: attachment.mime.clone(),
        }],
        annotations: Vec::new(),
    }
}

struct LinkRef {
    url: String,
    title: Option<String>,
    is_video: bool,
}

/// Link events first, then URLs found in text, deduplicated in order.
fn collect_links(batch: &Batch, texts: &[String]) -> Vec<LinkRef> {
    let mut links: Vec<LinkRef> = Vec::new();
    let mut push = |url: &str, title: Option<String>| {
        if links.iter().any(|l| l.url == url) {
            return;
        }
        links.push(LinkRef {
            url: url.to_string(),
            title,
            is_video: VIDEO_HOST_RE.is_match(url),
        });
    };

    for event in &batch.events {
        if let EventBody::Link { link, .. } = &event.body {
            push(&link.url, link.title.clone());
        }
    }
    for text in texts {
        for m in URL_RE.find_iter(text) {
            push(m.as_str(), None);
        }
    }
    links
}

fn links_template(texts: &[String], links: &[LinkRef]) -> Prompt {
    let listed: Vec<String> = links
        .iter()
        .map(|l| {
            let label = if l.is_video { "video" } else { "link" };
            match &l.title {
                Some(title) => format!("- {label}: {} ({title})", l.url),
                None => format!("- {label}: {}", l.url),
            }
        })
        .collect();

    let mut text = texts.join("\n");
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str("Referenced links:\n");
    text.push_str(&listed.join("\n"));

    Prompt {
        template: TemplateKind::Links,
        text,
        media: Vec::new(),
        annotations: Vec::new(),
    }
}

fn describe_media(kind: MediaKind, attachment: &MediaAttachment) -> String {
    let mut out = format!("{kind} url={}", attachment.url);
    if let Some(mime) = &attachment.mime {
        out.push_str(&format!(" mime={mime}"));
    }
    if let Some(ms) = attachment.duration_ms {
        out.push_str(&format!(" duration={:.1}s", ms as f64 / 1000.0));
    }
    if let Some(name) = &attachment.name {
        out.push_str(&format!(" name={name}"));
    }
    out
}
