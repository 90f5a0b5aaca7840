use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/// Finite, non-restartable sequence of text chunks from one generation
/// attempt. Ends with the last chunk or with an error item.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// Lightweight error info for logs and status payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&GatewayError> for GatewayErrorInfo {
    fn from(e: &GatewayError) -> Self {
        Self {
            kind: e.error_kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Build a chunk stream from already-known items.
pub fn chunks_from_iter<I>(items: I) -> ChunkStream
where
    I: IntoIterator<Item = Result<String, GatewayError>>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures::stream::iter(items))
}

/// Drain a stream into its full text, stopping at the first error.
pub async fn collect_text(mut stream: ChunkStream) -> Result<String, GatewayError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_concatenates_chunks() {
        let stream = chunks_from_iter(vec![Ok("hel".to_string()), Ok("lo".to_string())]);
        assert_eq!(collect_text(stream).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn collect_stops_at_error() {
        let stream = chunks_from_iter(vec![
            Ok("a".to_string()),
            Err(GatewayError::StreamInterrupted("eof".into())),
            Ok("b".to_string()),
        ]);
        let err = collect_text(stream).await.unwrap_err();
        assert_eq!(err.error_kind(), "stream_interrupted");
    }

    #[test]
    fn error_info_from_gateway_error() {
        let err = GatewayError::RateLimited { retry_after: None };
        let info = GatewayErrorInfo::from(&err);
        assert_eq!(info.kind, "rate_limited");
        assert!(info.message.contains("rate limited"));
    }
}
