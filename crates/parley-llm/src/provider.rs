use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Future, Stream};
use pin_project_lite::pin_project;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use secrecy::ExposeSecret;
use tokio::time::Sleep;
use tracing::{debug, instrument, warn};

use parley_core::context::LlmRequest;
use parley_core::credentials::CredentialSlot;
use parley_core::errors::GatewayError;
use parley_core::provider::LlmProvider;
use parley_core::stream::ChunkStream;

use crate::converter;
use crate::sse;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming client for the Gemini `streamGenerateContent` endpoint.
/// Each call uses the key and model of the slot it is handed.
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    idle_timeout: Duration,
}

impl GeminiProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        Self::with_idle_timeout(base_url, SSE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        base_url: impl Into<String>,
        idle_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            idle_timeout,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stream_url(&self, model: &str) -> String {
        format!("{}/models/{model}:streamGenerateContent?alt=sse", self.base_url)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(skip_all, fields(slot = %slot.id, model = %slot.model))]
    async fn stream(
        &self,
        slot: &CredentialSlot,
        request: &LlmRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let body = converter::build_request_body(request);

        let resp = self
            .client
            .post(self.stream_url(&slot.model))
            .header("x-goog-api-key", slot.credential.0.expose_secret())
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(CONNECT_TIMEOUT)
                } else {
                    GatewayError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            debug!(status, "provider returned error status");
            return Err(GatewayError::from_status(status, body, retry_after));
        }

        Ok(Box::pin(SseStream::with_idle_timeout(
            resp.bytes_stream(),
            self.idle_timeout,
        )))
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored and
/// the configured default cooldown applies instead.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pin_project! {
    /// Wraps a byte stream from reqwest and yields text chunks.
    /// If no bytes arrive within the idle window the stream yields
    /// `StreamInterrupted` and ends.
    struct SseStream {
        inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
        buffer: BytesMut,
        pending: VecDeque<Result<String, GatewayError>>,
        #[pin]
        idle_deadline: Sleep,
        idle_duration: Duration,
        finished: bool,
    }
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            idle_deadline: tokio::time::sleep(idle_timeout),
            idle_duration: idle_timeout,
            finished: false,
        }
    }
}

/// Parse complete frames out of `buffer` into `pending`. With `flush`, the
/// unterminated tail is parsed too. Frames are split on raw bytes so a
/// character cut across network chunks is only decoded once whole.
fn drain_frames(buffer: &mut BytesMut, pending: &mut VecDeque<Result<String, GatewayError>>, flush: bool) {
    let complete = if flush {
        buffer.split()
    } else {
        match buffer.windows(2).rposition(|w| w == b"\n\n") {
            Some(pos) => buffer.split_to(pos + 2),
            None => return,
        }
    };

    let text = match std::str::from_utf8(&complete) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, bytes = complete.len(), "skipping SSE frames with invalid UTF-8");
            return;
        }
    };

    for frame in sse::parse_sse_lines(text) {
        match sse::parse_chunk(&frame.data) {
            Ok(texts) => pending.extend(texts.into_iter().map(Ok)),
            Err(e) => {
                pending.push_back(Err(e));
                return;
            }
        }
    }
}

impl Stream for SseStream {
    type Item = Result<String, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(item) = this.pending.pop_front() {
                if item.is_err() {
                    // An error item ends the stream.
                    *this.finished = true;
                    this.pending.clear();
                }
                return Poll::Ready(Some(item));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + *this.idle_duration;
                    this.idle_deadline.as_mut().reset(deadline);

                    // CR never occurs inside a multi-byte sequence
                    this.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
                    drain_frames(this.buffer, this.pending, false);
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    drain_frames(this.buffer, this.pending, true);
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        *this.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            this.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
