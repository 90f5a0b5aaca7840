//! Finds `[tool:NAME]{json}[/tool]` spans in finished model output and runs
//! them against the [`ToolRegistry`].

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::FutureExt;
use regex::Regex;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use parley_core::directive::Span;
use parley_core::history::ContentPart;
use parley_core::ids::{ThreadId, ToolCallId};
use parley_core::tools::{ToolContext, ToolResult};

use crate::error::ToolCallError;
use crate::registry::ToolRegistry;
use crate::schema::validate_params;
use crate::truncate::truncate_output;

static TOOL_SPAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[tool:([A-Za-z0-9_.\-]+)\](.*?)\[/tool\]").expect("valid regex")
});

/// One tool span as written by the model. `body` is unparsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub name: String,
    pub body: String,
    pub span: Span,
}

/// Tool spans in order of appearance.
pub fn find_tool_calls(text: &str) -> Vec<ToolCall> {
    TOOL_SPAN_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(ToolCall {
                name: caps[1].to_string(),
                body: caps[2].trim().to_string(),
                span: Span::new(whole.start(), whole.end()),
            })
        })
        .collect()
}

#[derive(Debug)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub result: Result<ToolResult, ToolCallError>,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// `{"tool", "success", "data" | "error"}` as stored in history.
    pub fn to_json(&self) -> Value {
        match &self.result {
            Ok(result) => json!({
                "tool": self.call.name,
                "success": true,
                "data": result.data,
            }),
            Err(e) => json!({
                "tool": self.call.name,
                "success": false,
                "error": e.message(),
            }),
        }
    }

    pub fn to_part(&self) -> ContentPart {
        ContentPart::text(self.to_json().to_string())
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_output_chars: usize,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration, max_output_chars: usize) -> Self {
        Self {
            registry,
            timeout,
            max_output_chars,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run every tool span in `text`, one after another. Stops early once
    /// `token` is cancelled; calls not yet started are dropped.
    #[instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn execute_all(
        &self,
        thread_id: &ThreadId,
        text: &str,
        token: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::new();
        for call in find_tool_calls(text) {
            if token.is_cancelled() {
                debug!(tool = %call.name, "skipping tool call after cancellation");
                break;
            }
            let result = self.execute_one(thread_id, &call, token).await;
            if let Err(e) = &result {
                debug!(tool = %call.name, error = %e, "tool call failed");
            }
            outcomes.push(ToolOutcome { call, result });
        }
        outcomes
    }

    async fn execute_one(
        &self,
        thread_id: &ThreadId,
        call: &ToolCall,
        token: &CancellationToken,
    ) -> Result<ToolResult, ToolCallError> {
        let validation = |message: String| ToolCallError::Validation {
            tool: call.name.clone(),
            message,
        };
        let execution = |message: String| ToolCallError::Execution {
            tool: call.name.clone(),
            message,
        };

        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| validation("unknown tool".into()))?;
        let params: Value = if call.body.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.body)
                .map_err(|e| validation(format!("invalid JSON parameters: {e}")))?
        };
        validate_params(&tool.parameters_schema(), &params).map_err(validation)?;

        let ctx = ToolContext {
            thread_id: thread_id.clone(),
            call_id: ToolCallId::new(),
            abort_signal: token.child_token(),
        };
        let start = Instant::now();
        let run = tokio::time::timeout(
            self.timeout,
            AssertUnwindSafe(tool.execute(params, &ctx)).catch_unwind(),
        );
        let result = tokio::select! {
            biased;
            () = token.cancelled() => return Err(execution("cancelled".into())),
            result = run => result,
        };
        let duration = start.elapsed();

        match result {
            Ok(Ok(Ok(mut r))) => {
                r.duration = duration;
                r.data = truncate_data(r.data, self.max_output_chars);
                if r.is_error {
                    return Err(execution(value_text(&r.data)));
                }
                debug!(tool = %call.name, duration_ms = duration.as_millis() as u64, "tool completed");
                Ok(r)
            }
            Ok(Ok(Err(e))) => Err(execution(e.to_string())),
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                Err(execution("internal error: tool crashed".into()))
            }
            Err(_) => {
                warn!(
                    tool = %call.name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "tool timed out"
                );
                Err(execution(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Oversized structured output is replaced by its truncated JSON text.
fn truncate_data(data: Value, max_chars: usize) -> Value {
    match data {
        Value::String(s) => Value::String(truncate_output(&s, max_chars)),
        other => {
            let text = other.to_string();
            if text.chars().count() <= max_chars {
                other
            } else {
                Value::String(truncate_output(&text, max_chars))
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
