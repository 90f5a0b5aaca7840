use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::context::LlmRequest;
use parley_core::credentials::CredentialSlot;
use parley_core::errors::GatewayError;
use parley_core::provider::LlmProvider;
use parley_core::stream::{chunks_from_iter, ChunkStream};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of chunk items.
    Chunks(Vec<Result<String, GatewayError>>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: the whole text as a single chunk.
    pub fn text(text: &str) -> Self {
        Self::Chunks(vec![Ok(text.to_string())])
    }

    /// Convenience: one chunk per slice.
    pub fn chunked(chunks: &[&str]) -> Self {
        Self::Chunks(chunks.iter().map(|c| Ok((*c).to_string())).collect())
    }

    /// Convenience: some chunks, then an error item.
    pub fn chunks_then_error(chunks: &[&str], error: GatewayError) -> Self {
        let mut items: Vec<_> = chunks.iter().map(|c| Ok((*c).to_string())).collect();
        items.push(Err(error));
        Self::Chunks(items)
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records which slot each call used.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    slots_used: Mutex<Vec<String>>,
    requests: Mutex<Vec<LlmRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            slots_used: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Queue another response behind the existing ones.
    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Slot ids in call order.
    pub fn slots_used(&self) -> Vec<String> {
        self.slots_used.lock().clone()
    }

    /// Requests in call order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        slot: &CredentialSlot,
        request: &LlmRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.slots_used.lock().push(slot.id.clone());
        self.requests.lock().push(request.clone());

        let Some(response) = self.responses.lock().pop_front() else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ChunkStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Chunks(items) => return Ok(chunks_from_iter(items)),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::credentials::ApiKey;
    use parley_core::stream::collect_text;

    fn slot(id: &str) -> CredentialSlot {
        CredentialSlot::new(id, ApiKey::new("k"), "mock-model")
    }

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::chunked(&["hello", " world"])]);
        let stream = mock.stream(&slot("s0"), &LlmRequest::empty()).await.unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(GatewayError::CredentialRejected(
            "bad".into(),
        ))]);
        let result = mock.stream(&slot("s0"), &LlmRequest::empty()).await;
        assert!(matches!(result, Err(GatewayError::CredentialRejected(_))));
    }

    #[tokio::test]
    async fn sequential_responses_record_slots() {
        let mock = MockProvider::new(vec![MockResponse::text("first"), MockResponse::text("second")]);

        let _ = mock.stream(&slot("a"), &LlmRequest::empty()).await.unwrap();
        let _ = mock.stream(&slot("b"), &LlmRequest::empty()).await.unwrap();

        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.slots_used(), vec!["a", "b"]);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockResponse::text("only one")]);
        let _ = mock.stream(&slot("s0"), &LlmRequest::empty()).await;
        let result = mock.stream(&slot("s0"), &LlmRequest::empty()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn chunks_then_error_yields_error_item() {
        let mock = MockProvider::new(vec![MockResponse::chunks_then_error(
            &["par", "tial"],
            GatewayError::StreamInterrupted("reset".into()),
        )]);
        let stream = mock.stream(&slot("s0"), &LlmRequest::empty()).await.unwrap();
        let err = collect_text(stream).await.unwrap_err();
        assert_eq!(err.error_kind(), "stream_interrupted");
    }

    #[tokio::test]
    async fn delayed_error() {
        tokio::time::pause();
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(20),
            MockResponse::Error(GatewayError::RateLimited { retry_after: None }),
        )]);

        let start = tokio::time::Instant::now();
        let result = mock.stream(&slot("s0"), &LlmRequest::empty()).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
        match result {
            Err(GatewayError::RateLimited { .. }) => {}
            Err(other) => panic!("expected RateLimited, got: {other:?}"),
            Ok(_) => panic!("expected error"),
        }
    }
}
