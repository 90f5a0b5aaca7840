//! Incremental parser for bracketed directives in streamed model output.
//!
//! Grammar: self-closing `[TYPE:arg1:arg2]` and block `[TYPE:arg]...[/TYPE]`.
//! Recognised keywords (case-insensitive):
//!
//! | keyword              | form         | effect                                   |
//! |----------------------|--------------|------------------------------------------|
//! | `reaction`, `react`  | self-closing | react; optional 1-based batch index      |
//! | `sticker`            | self-closing | send a sticker                           |
//! | `quote`              | self-closing | quote target for the next/current message|
//! | `undo`               | self-closing | retract the n-th most recent sent message|
//! | `msg`, `message`     | block        | send the enclosed text                   |
//!
//! Anything else, stray closers, and tags longer than [`MAX_TAG_LEN`] stay
//! literal. Text outside a `msg` block is narration and is never sent.
//!
//! Directives are returned the moment their closing `]` is seen. Spans are
//! byte offsets into the whole stream and come out in closing order.

use parley_core::directive::{DirectiveKind, QuoteTarget, Span, StreamDirective};

/// Longest tag body (between the brackets) treated as a directive.
pub const MAX_TAG_LEN: usize = 128;

#[derive(Debug)]
struct OpenBlock {
    /// Where the message span begins: the opener, or the end of the latest
    /// directive emitted from inside the block.
    start: usize,
    text: String,
    quote: Option<QuoteTarget>,
}

/// Streaming directive parser. One per generation round.
///
/// Output is ordered by closing delimiter. A reaction, sticker or undo
/// written inside a `msg` block is returned as soon as its `]` arrives,
/// ahead of the enclosing message. The message span then starts where that
/// directive ended, so spans never overlap and their starts ascend in
/// output order. A `quote` inside a block is folded into the message and
/// not returned on its own.
#[derive(Debug, Default)]
pub struct DirectiveParser {
    /// Unconsumed input, starting at stream offset `offset`.
    buf: String,
    offset: usize,
    narration: String,
    block: Option<OpenBlock>,
}

impl DirectiveParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every directive it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamDirective> {
        self.buf.push_str(chunk);
        self.scan(false)
    }

    /// End of stream: unterminated tags become literal and an open `msg`
    /// block is flushed as one final message.
    pub fn finish(&mut self) -> Vec<StreamDirective> {
        let mut out = self.scan(true);
        let end = self.offset;
        if let Some(block) = self.block.take() {
            out.extend(block_message(block, end));
        }
        out
    }

    /// Text of an open `msg` block plus any unparsed tail inside it.
    /// Clears both. Narration is not included; it was never meant to be sent.
    pub fn take_unflushed(&mut self) -> String {
        let tail = std::mem::take(&mut self.buf);
        self.offset += tail.len();
        match self.block.take() {
            Some(mut block) => {
                block.text.push_str(&tail);
                block.text.trim().to_string()
            }
            None => String::new(),
        }
    }

    /// Text seen outside any `msg` block so far.
    pub fn narration(&self) -> &str {
        &self.narration
    }

    pub fn in_block(&self) -> bool {
        self.block.is_some()
    }

    fn scan(&mut self, at_end: bool) -> Vec<StreamDirective> {
        let mut out = Vec::new();
        let mut pos = 0;

        loop {
            let Some(rel) = self.buf[pos..].find('[') else {
                append_text(&mut self.block, &mut self.narration, &self.buf[pos..]);
                pos = self.buf.len();
                break;
            };
            let open = pos + rel;
            append_text(&mut self.block, &mut self.narration, &self.buf[pos..open]);

            let body_start = open + 1;
            let stop = self.buf[body_start..].find([']', '[', '\n']);
            match stop {
                Some(r) if r <= MAX_TAG_LEN && self.buf[body_start + r..].starts_with(']') => {
                    let close = body_start + r;
                    let inner = self.buf[body_start..close].to_string();
                    let span = Span::new(self.offset + open, self.offset + close + 1);
                    match self.interpret(&inner, span) {
                        Some(directives) => {
                            out.extend(directives);
                            pos = close + 1;
                        }
                        None => {
                            append_text(&mut self.block, &mut self.narration, "[");
                            pos = body_start;
                        }
                    }
                }
                None if !at_end && self.buf.len() - body_start <= MAX_TAG_LEN => {
                    // Possibly a tag split across chunks; wait for more.
                    pos = open;
                    break;
                }
                _ => {
                    append_text(&mut self.block, &mut self.narration, "[");
                    pos = body_start;
                }
            }
        }

        self.buf.drain(..pos);
        self.offset += pos;
        out
    }

    /// `None` means the tag is not a directive and stays literal.
    fn interpret(&mut self, inner: &str, span: Span) -> Option<Vec<StreamDirective>> {
        let trimmed = inner.trim();

        if let Some(name) = trimmed.strip_prefix('/') {
            let keyword = name.trim().to_ascii_lowercase();
            if is_block_keyword(&keyword) {
                let block = self.block.take()?;
                return Some(block_message(block, span.end).into_iter().collect());
            }
            return None;
        }

        let (keyword, args) = match trimmed.split_once(':') {
            Some((k, rest)) => (k.trim().to_ascii_lowercase(), rest),
            None => (trimmed.to_ascii_lowercase(), ""),
        };
        let mut parts = args.split(':').map(str::trim);
        let arg1 = parts.next().unwrap_or("");
        let arg2 = parts.next();

        let kind = match keyword.as_str() {
            k if is_block_keyword(k) => {
                // A new opener implicitly closes a block left open.
                let previous = self.block.take();
                self.block = Some(OpenBlock {
                    start: span.start,
                    text: String::new(),
                    quote: QuoteTarget::parse(arg1),
                });
                return Some(
                    previous
                        .and_then(|b| block_message(b, span.start))
                        .into_iter()
                        .collect(),
                );
            }
            "reaction" | "react" if !arg1.is_empty() => DirectiveKind::Reaction {
                reaction: arg1.to_string(),
                target: arg2.and_then(|a| a.parse::<usize>().ok()).filter(|&n| n > 0),
            },
            "sticker" if !args.trim().is_empty() => DirectiveKind::Sticker {
                sticker: args.trim().to_string(),
            },
            "quote" => {
                let target = QuoteTarget::parse(arg1)?;
                if let Some(block) = self.block.as_mut() {
                    block.quote = Some(target);
                    return Some(Vec::new());
                }
                DirectiveKind::QuoteRef { target }
            }
            "undo" => {
                let recent = if arg1.is_empty() {
                    1
                } else {
                    arg1.parse::<usize>().ok().filter(|&n| n > 0)?
                };
                DirectiveKind::Undo { recent }
            }
            _ => return None,
        };

        if let Some(block) = self.block.as_mut() {
            block.start = span.end;
        }
        Some(vec![StreamDirective { kind, span }])
    }
}

fn is_block_keyword(keyword: &str) -> bool {
    matches!(keyword, "msg" | "message")
}

fn append_text(block: &mut Option<OpenBlock>, narration: &mut String, text: &str) {
    match block {
        Some(b) => b.text.push_str(text),
        None => narration.push_str(text),
    }
}

/// Empty blocks produce nothing.
fn block_message(block: OpenBlock, end: usize) -> Option<StreamDirective> {
    let text = block.text.trim();
    if text.is_empty() {
        return None;
    }
    Some(StreamDirective {
        kind: DirectiveKind::Message {
            text: text.to_string(),
            quote: block.quote,
        },
        span: Span::new(block.start, end),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> (Vec<StreamDirective>, DirectiveParser) {
        let mut parser = DirectiveParser::new();
        let mut out = parser.feed(input);
        out.extend(parser.finish());
        (out, parser)
    }

    fn kinds(input: &str) -> Vec<DirectiveKind> {
        parse_all(input).0.into_iter().map(|d| d.kind).collect()
    }

    fn message(text: &str) -> DirectiveKind {
        DirectiveKind::Message {
            text: text.into(),
            quote: None,
        }
    }

    #[test]
    fn reaction_then_message_with_narration_withheld() {
        let input = "hello [reaction:heart] world [msg]done[/msg]";
        let mut parser = DirectiveParser::new();
        let mut seen = Vec::new();
        for (i, ch) in input.char_indices() {
            for d in parser.feed(&ch.to_string()) {
                seen.push((i, d.kind));
            }
        }
        assert!(parser.finish().is_empty());

        let heart_close = input.find("heart]").unwrap() + "heart".len();
        let msg_close = input.len() - 1;
        assert_eq!(
            seen,
            vec![
                (
                    heart_close,
                    DirectiveKind::Reaction {
                        reaction: "heart".into(),
                        target: None
                    }
                ),
                (msg_close, message("done")),
            ]
        );
        assert_eq!(parser.narration(), "hello  world ");
    }

    #[test]
    fn spans_are_stream_offsets() {
        let (out, _) = parse_all("ab[sticker:s1]cd[msg]x[/msg]");
        assert_eq!(out[0].span, Span::new(2, 14));
        assert_eq!(out[1].span, Span::new(16, 28));
        assert!(out[0].span.end <= out[1].span.start);
    }

    #[test]
    fn tag_split_across_chunks() {
        let mut parser = DirectiveParser::new();
        assert!(parser.feed("ok [rea").is_empty());
        assert!(parser.feed("ction:li").is_empty());
        let out = parser.feed("ke] more");
        assert_eq!(
            out[0].kind,
            DirectiveKind::Reaction {
                reaction: "like".into(),
                target: None
            }
        );
    }

    #[test]
    fn keywords_case_insensitive() {
        assert_eq!(kinds("[MSG]Hi[/Msg]"), vec![message("Hi")]);
        assert_eq!(
            kinds("[React:wow:2]"),
            vec![DirectiveKind::Reaction {
                reaction: "wow".into(),
                target: Some(2)
            }]
        );
    }

    #[test]
    fn unknown_keywords_stay_literal() {
        let (out, parser) = parse_all("[foo:bar] hi");
        assert!(out.is_empty());
        assert_eq!(parser.narration(), "[foo:bar] hi");

        assert_eq!(kinds("[msg]a [foo] b[/msg]"), vec![message("a [foo] b")]);
    }

    #[test]
    fn stray_closers_stay_literal() {
        let (out, parser) = parse_all("[/msg] x");
        assert!(out.is_empty());
        assert_eq!(parser.narration(), "[/msg] x");
        assert_eq!(kinds("[msg]x[/reaction][/msg]"), vec![message("x[/reaction]")]);
    }

    #[test]
    fn overlong_and_broken_tags_are_literal() {
        let long = format!("[msg]{}[{}][/msg]", "t", "a".repeat(MAX_TAG_LEN + 10));
        let expected = format!("t[{}]", "a".repeat(MAX_TAG_LEN + 10));
        assert_eq!(kinds(&long), vec![message(&expected)]);

        assert_eq!(kinds("[msg]a [reaction\nb[/msg]"), vec![message("a [reaction\nb")]);
    }

    #[test]
    fn unterminated_tag_at_end_is_literal() {
        assert_eq!(kinds("[msg]see [stick"), vec![message("see [stick")]);
    }

    #[test]
    fn unclosed_block_flushed_at_finish() {
        let mut parser = DirectiveParser::new();
        assert!(parser.feed("[msg]partial answer").is_empty());
        assert!(parser.in_block());
        let out = parser.finish();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, message("partial answer"));
        assert_eq!(out[0].span, Span::new(0, 19));
    }

    #[test]
    fn quote_inside_block_applies_to_that_message() {
        assert_eq!(
            kinds("[msg][quote:2]sure[/msg]"),
            vec![DirectiveKind::Message {
                text: "sure".into(),
                quote: Some(QuoteTarget::BatchIndex(2))
            }]
        );
        assert_eq!(
            kinds("[msg:abc]ok[/msg]"),
            vec![DirectiveKind::Message {
                text: "ok".into(),
                quote: Some(QuoteTarget::MessageId("abc".into()))
            }]
        );
    }

    #[test]
    fn quote_outside_block_is_its_own_directive() {
        assert_eq!(
            kinds("[quote:1][msg]x[/msg]"),
            vec![
                DirectiveKind::QuoteRef {
                    target: QuoteTarget::BatchIndex(1)
                },
                message("x"),
            ]
        );
        // zero is not a target
        assert!(kinds("[quote:0]").is_empty());
    }

    #[test]
    fn undo_arguments() {
        assert_eq!(kinds("[undo]"), vec![DirectiveKind::Undo { recent: 1 }]);
        assert_eq!(kinds("[undo:3]"), vec![DirectiveKind::Undo { recent: 3 }]);
        assert!(kinds("[undo:abc]").is_empty());
    }

    #[test]
    fn sticker_ref_keeps_colons() {
        assert_eq!(
            kinds("[sticker:pack:42]"),
            vec![DirectiveKind::Sticker {
                sticker: "pack:42".into()
            }]
        );
        assert!(kinds("[sticker]").is_empty());
    }

    #[test]
    fn new_opener_closes_open_block() {
        assert_eq!(
            kinds("[msg]one[msg]two[/msg]"),
            vec![message("one"), message("two")]
        );
    }

    #[test]
    fn empty_blocks_send_nothing() {
        assert!(kinds("[msg]   [/msg]").is_empty());
    }

    #[test]
    fn self_closing_inside_block_dispatches_immediately() {
        let mut parser = DirectiveParser::new();
        let out = parser.feed("[msg]nice [reaction:heart]");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind.name(), "reaction");
        let reaction = out[0].span;
        let out = parser.feed(" pic[/msg]");
        assert_eq!(out[0].kind, message("nice  pic"));

        assert_eq!(reaction, Span::new(10, 26));
        assert_eq!(out[0].span, Span::new(26, 36));
    }

    #[test]
    fn spans_never_overlap_with_directives_inside_blocks() {
        let (out, _) = parse_all("[msg]a [react:ok] b [sticker:s1] c[/msg] x [undo]");
        let names: Vec<_> = out.iter().map(|d| d.kind.name()).collect();
        assert_eq!(names, vec!["reaction", "sticker", "message", "undo"]);
        for pair in out.windows(2) {
            assert!(pair[0].span.end <= pair[1].span.start, "{pair:?}");
        }
        assert_eq!(out[2].kind, message("a  b  c"));
    }

    #[test]
    fn tool_spans_are_narration() {
        let (out, parser) = parse_all(r#"[tool:weather]{"city":"Hanoi"}[/tool]"#);
        assert!(out.is_empty());
        assert!(parser.narration().contains("[tool:weather]"));
    }

    #[test]
    fn take_unflushed_returns_open_block_text() {
        let mut parser = DirectiveParser::new();
        parser.feed("narration [msg]half a sen");
        parser.feed("tence [sti");
        assert_eq!(parser.take_unflushed(), "half a sentence [sti");
        assert!(!parser.in_block());
        assert!(parser.finish().is_empty());

        let mut parser = DirectiveParser::new();
        parser.feed("only narration");
        assert_eq!(parser.take_unflushed(), "");
    }

    #[test]
    fn multibyte_text_offsets() {
        let (out, _) = parse_all("chào [msg]xin chào 👋[/msg]");
        assert_eq!(out[0].kind, message("xin chào 👋"));
        assert_eq!(out[0].span.start, "chào ".len());
    }
}
