use serde::{Deserialize, Serialize};

/// Byte range in the raw model stream, end exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// What a `[quote:..]` directive points at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteTarget {
    /// 1-based index into the current batch.
    BatchIndex(usize),
    MessageId(String),
}

impl QuoteTarget {
    pub fn parse(arg: &str) -> Option<Self> {
        let arg = arg.trim();
        if arg.is_empty() {
            return None;
        }
        match arg.parse::<usize>() {
            Ok(0) => None,
            Ok(n) => Some(Self::BatchIndex(n)),
            Err(_) => Some(Self::MessageId(arg.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectiveKind {
    /// `target` is a 1-based batch index; `None` means the latest message.
    Reaction { reaction: String, target: Option<usize> },
    Sticker { sticker: String },
    Message { text: String, quote: Option<QuoteTarget> },
    /// Sets the quote target of the next message.
    QuoteRef { target: QuoteTarget },
    /// Retract the n-th most recent message sent this round (1 = last).
    Undo { recent: usize },
}

impl DirectiveKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reaction { .. } => "reaction",
            Self::Sticker { .. } => "sticker",
            Self::Message { .. } => "message",
            Self::QuoteRef { .. } => "quote",
            Self::Undo { .. } => "undo",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDirective {
    pub kind: DirectiveKind,
    pub span: Span,
}
