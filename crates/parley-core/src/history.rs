use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::MediaKind;
use crate::ids::{EntryId, ThreadId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One piece of an entry's content. Media is stored by reference only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Media {
        kind: MediaKind,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Characters this part contributes to the fallback token estimate.
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text { text } => text.chars().count(),
            Self::Media { url, .. } => url.chars().count(),
        }
    }
}

/// Append-only record of one conversational turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: EntryId,
    pub thread_id: ThreadId,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
    pub token_cost: u32,
}

impl HistoryEntry {
    /// Concatenated text parts, newline separated.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Media { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip_str() {
        for role in [Role::User, Role::Model, Role::Tool] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("assistant".parse::<Role>().is_err());
    }

    #[test]
    fn char_len_counts_media_url() {
        let part = ContentPart::Media {
            kind: MediaKind::Image,
            url: "abcd".into(),
            mime: None,
        };
        assert_eq!(part.char_len(), 4);
        assert_eq!(ContentPart::text("héllo").char_len(), 5);
    }

    #[test]
    fn entry_text_skips_media() {
        let entry = HistoryEntry {
            id: EntryId::new(),
            thread_id: ThreadId::from_raw("t"),
            role: Role::User,
            parts: vec![
                ContentPart::text("one"),
                ContentPart::Media {
                    kind: MediaKind::File,
                    url: "https://x".into(),
                    mime: None,
                },
                ContentPart::text("two"),
            ],
            created_at: Utc::now(),
            token_cost: 5,
        };
        assert_eq!(entry.text(), "one\ntwo");
    }

    #[test]
    fn content_part_serde_tagged() {
        let json = serde_json::to_value(ContentPart::text("x")).unwrap();
        assert_eq!(json["type"], "text");
    }
}
