//! Consumes a chunk stream, parses directives, and performs their side
//! effects on the transport as soon as each one closes.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use parley_core::directive::{DirectiveKind, QuoteTarget, StreamDirective};
use parley_core::errors::GatewayError;
use parley_core::events::{Batch, MessageRef};
use parley_core::ids::ThreadId;
use parley_core::stream::ChunkStream;
use parley_core::transport::{OutboundMessage, Transport};

use crate::cancel::CancelRegistry;
use crate::directive::DirectiveParser;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Minimum gap between consecutive sends (messages and stickers).
    pub send_pacing: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_pacing: Duration::from_millis(800),
        }
    }
}

/// What one round of dispatching did.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Every chunk received, unparsed.
    pub raw_text: String,
    /// Messages and stickers delivered this round that were not undone.
    pub sent: Vec<MessageRef>,
    /// Count of side effects the transport accepted.
    pub actions: usize,
    /// Stream failed after it started.
    pub interrupted: Option<GatewayError>,
    pub cancelled: bool,
    /// When the latest message or sticker went out. Pass it to the next
    /// round so pacing holds across tool rounds.
    pub last_send: Option<Instant>,
}

enum Flow {
    Continue,
    Cancelled,
}

struct RoundState {
    sent: Vec<MessageRef>,
    next_quote: Option<QuoteTarget>,
    last_send: Option<Instant>,
    actions: usize,
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    cancel: Arc<CancelRegistry>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        cancel: Arc<CancelRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            transport,
            cancel,
            config,
        }
    }

    /// Drive `stream` to completion or cancellation.
    ///
    /// Directives fire in closing-delimiter order. On cancellation, output
    /// that was parsed or buffered but not delivered goes to the thread's
    /// pending-merge queue. Delivered side effects are never rolled back.
    /// `last_send` is the previous round's final send, if any; the first
    /// send here still waits out the pacing gap from it.
    #[instrument(skip_all, fields(thread_id = %batch.thread_id))]
    pub async fn run(
        &self,
        mut stream: ChunkStream,
        batch: &Batch,
        token: &CancellationToken,
        last_send: Option<Instant>,
    ) -> DispatchOutcome {
        let thread = &batch.thread_id;
        let mut parser = DirectiveParser::new();
        let mut outcome = DispatchOutcome::default();
        let mut round = RoundState {
            sent: Vec::new(),
            next_quote: None,
            last_send,
            actions: 0,
        };

        loop {
            // biased: a ready cancellation wins over a ready chunk
            let item = tokio::select! {
                biased;
                () = token.cancelled() => {
                    self.abandon(thread, &mut parser, &[]);
                    outcome.cancelled = true;
                    break;
                }
                item = stream.next() => item,
            };

            match item {
                None => {
                    let directives = parser.finish();
                    if let Err(rest) = self.apply_all(&directives, batch, token, &mut round).await {
                        self.abandon(thread, &mut parser, rest);
                        outcome.cancelled = true;
                    }
                    break;
                }
                Some(Ok(chunk)) => {
                    outcome.raw_text.push_str(&chunk);
                    let directives = parser.feed(&chunk);
                    if let Err(rest) = self.apply_all(&directives, batch, token, &mut round).await {
                        self.abandon(thread, &mut parser, rest);
                        outcome.cancelled = true;
                        break;
                    }
                }
                Some(Err(error)) => {
                    warn!(error = %error, "stream interrupted mid-round");
                    self.cancel.push_pending(thread, parser.take_unflushed());
                    outcome.interrupted = Some(error);
                    break;
                }
            }
        }

        outcome.sent = round.sent;
        outcome.actions = round.actions;
        outcome.last_send = round.last_send;
        debug!(
            actions = outcome.actions,
            cancelled = outcome.cancelled,
            narration_len = parser.narration().len(),
            "dispatch finished"
        );
        outcome
    }

    /// Apply in order. On cancellation returns the directives not yet done.
    async fn apply_all<'a>(
        &self,
        directives: &'a [StreamDirective],
        batch: &Batch,
        token: &CancellationToken,
        round: &mut RoundState,
    ) -> Result<(), &'a [StreamDirective]> {
        for (i, directive) in directives.iter().enumerate() {
            if token.is_cancelled() {
                return Err(&directives[i..]);
            }
            if let Flow::Cancelled = self.apply(&directive.kind, batch, token, round).await {
                return Err(&directives[i..]);
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        kind: &DirectiveKind,
        batch: &Batch,
        token: &CancellationToken,
        round: &mut RoundState,
    ) -> Flow {
        let thread = &batch.thread_id;
        match kind {
            DirectiveKind::QuoteRef { target } => {
                round.next_quote = Some(target.clone());
            }
            DirectiveKind::Reaction { reaction, target } => {
                let message = target
                    .and_then(|i| batch.nth(i))
                    .map(|e| &e.message)
                    .or_else(|| batch.last_message());
                let Some(message) = message else {
                    debug!(reaction = %reaction, "no message to react to");
                    return Flow::Continue;
                };
                match self.transport.react(thread, reaction, message).await {
                    Ok(()) => round.actions += 1,
                    Err(e) => warn!(error = %e, reaction = %reaction, "reaction failed"),
                }
            }
            DirectiveKind::Message { text, quote } => {
                let queued = round.next_quote.take();
                let quote = quote
                    .as_ref()
                    .or(queued.as_ref())
                    .and_then(|t| resolve_quote(t, batch));
                if !self.pace(token, round).await {
                    return Flow::Cancelled;
                }
                let message = OutboundMessage {
                    text: text.clone(),
                    quote,
                };
                let result = self.transport.send(thread, message).await;
                round.last_send = Some(Instant::now());
                match result {
                    Ok(sent) => {
                        round.sent.push(sent);
                        round.actions += 1;
                    }
                    Err(e) => warn!(error = %e, "send failed"),
                }
            }
            DirectiveKind::Sticker { sticker } => {
                if !self.pace(token, round).await {
                    return Flow::Cancelled;
                }
                let result = self.transport.send_sticker(thread, sticker).await;
                round.last_send = Some(Instant::now());
                match result {
                    Ok(sent) => {
                        round.sent.push(sent);
                        round.actions += 1;
                    }
                    Err(e) => warn!(error = %e, sticker = %sticker, "sticker failed"),
                }
            }
            DirectiveKind::Undo { recent } => {
                let Some(index) = round.sent.len().checked_sub(*recent) else {
                    debug!(recent, sent = round.sent.len(), "nothing to undo");
                    return Flow::Continue;
                };
                let target = round.sent.remove(index);
                match self.transport.undo(thread, &target).await {
                    Ok(()) => round.actions += 1,
                    Err(e) => warn!(error = %e, msg_id = %target.msg_id, "undo failed"),
                }
            }
        }
        Flow::Continue
    }

    /// Wait out the pacing gap since the last send. `false` if cancelled.
    async fn pace(&self, token: &CancellationToken, round: &RoundState) -> bool {
        if let Some(last) = round.last_send {
            let due = last + self.config.send_pacing;
            tokio::select! {
                biased;
                () = token.cancelled() => return false,
                () = tokio::time::sleep_until(due) => {}
            }
        }
        !token.is_cancelled()
    }

    /// Queue undelivered messages, then the open block, for the next round.
    fn abandon(&self, thread: &ThreadId, parser: &mut DirectiveParser, rest: &[StreamDirective]) {
        for directive in rest {
            if let DirectiveKind::Message { text, .. } = &directive.kind {
                self.cancel.push_pending(thread, text.clone());
            }
        }
        self.cancel.push_pending(thread, parser.take_unflushed());
        debug!(thread_id = %thread, undelivered = rest.len(), "round cancelled");
    }
}

/// Batch indices resolve against the batch; unknown ids are passed through.
fn resolve_quote(target: &QuoteTarget, batch: &Batch) -> Option<MessageRef> {
    match target {
        QuoteTarget::BatchIndex(i) => batch.nth(*i).map(|e| e.message.clone()),
        QuoteTarget::MessageId(id) => Some(
            batch
                .events
                .iter()
                .find(|e| &e.message.msg_id == id)
                .map(|e| e.message.clone())
                .unwrap_or_else(|| MessageRef::new(id.clone())),
        ),
    }
}
