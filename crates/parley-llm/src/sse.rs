use serde::Deserialize;

use parley_core::errors::GatewayError;

/// One `data:` payload from an SSE stream, with its event name if present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Split raw SSE text into frames. Multi-line `data:` fields are joined
/// with `\n`; comment lines (`:`) are skipped.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.is_empty() {
            if !data.is_empty() {
                frames.push(SseFrame {
                    event: event.take(),
                    data: data.join("\n"),
                });
                data.clear();
            }
            event = None;
        } else if line.starts_with(':') {
            continue;
        } else if let Some(v) = line.strip_prefix("event:") {
            event = Some(v.trim_start().to_string());
        } else if let Some(v) = line.strip_prefix("data:") {
            data.push(v.strip_prefix(' ').unwrap_or(v));
        }
    }

    // Handle trailing frame without blank line
    if !data.is_empty() {
        frames.push(SseFrame {
            event,
            data: data.join("\n"),
        });
    }

    frames
}

/// Extract text deltas from one `streamGenerateContent` payload.
///
/// Errors embedded in the stream (`{"error": {"code": 429, ...}}`) are
/// classified the same way as HTTP status failures.
pub fn parse_chunk(data: &str) -> Result<Vec<String>, GatewayError> {
    let chunk: GenerateChunk = serde_json::from_str(data)
        .map_err(|e| GatewayError::StreamInterrupted(format!("malformed chunk: {e}")))?;

    if let Some(err) = chunk.error {
        return Err(GatewayError::from_status(err.code, err.message, None));
    }

    if let Some(feedback) = chunk.prompt_feedback {
        if let Some(reason) = feedback.block_reason {
            return Err(GatewayError::InvalidRequest(format!("prompt blocked: {reason}")));
        }
    }

    Ok(chunk
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter(|p| !p.thought)
        .filter_map(|p| p.text)
        .filter(|t| !t.is_empty())
        .collect())
}

// --- Deserialization types for streamed generate responses ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    code: u16,
    #[serde(default)]
    message: String,
}
