//! One generation task per batch: compose, generate, dispatch, persist, and
//! loop through tool rounds.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::context::{GenerationOptions, LlmRequest};
use parley_core::events::Batch;
use parley_core::history::{ContentPart, Role};
use parley_core::ids::ThreadId;
use parley_core::transport::{OutboundMessage, Transport};
use parley_llm::RotatingGateway;

use crate::cancel::{CancelRegistry, GenerationTask};
use crate::composer::compose;
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::toolloop::{find_tool_calls, ToolExecutor};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Token budget for history included in each request.
    pub history_budget: u32,
    /// Extra generation rounds allowed for tool calls.
    pub max_tool_rounds: u32,
    /// Sent once when generation fails before anything was dispatched.
    /// Empty disables it.
    pub apology: String,
    pub system_instruction: Option<String>,
    pub generation: GenerationOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_budget: 8_000,
            max_tool_rounds: 3,
            apology: "Sorry, I can't answer right now. Please try again in a moment.".into(),
            system_instruction: None,
            generation: GenerationOptions::default(),
        }
    }
}

/// Summary of a completed task.
#[derive(Debug, Default)]
pub struct RoundReport {
    pub task_id: u64,
    /// Generation rounds run, including tool rounds.
    pub rounds: u32,
    /// Messages and stickers delivered and not undone.
    pub sent: usize,
    pub actions: usize,
    pub tool_calls: usize,
    /// Raw model output of the last round.
    pub final_text: String,
}

pub struct Pipeline {
    gateway: Arc<RotatingGateway>,
    history: Arc<HistoryStore>,
    dispatcher: Dispatcher,
    tools: ToolExecutor,
    cancel: Arc<CancelRegistry>,
    transport: Arc<dyn Transport>,
    system_instruction: Option<String>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        gateway: Arc<RotatingGateway>,
        history: Arc<HistoryStore>,
        dispatcher: Dispatcher,
        tools: ToolExecutor,
        cancel: Arc<CancelRegistry>,
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
    ) -> Self {
        let system_instruction = build_system_instruction(config.system_instruction.as_deref(), &tools);
        Self {
            gateway,
            history,
            dispatcher,
            tools,
            cancel,
            transport,
            system_instruction,
            config,
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn gateway(&self) -> &Arc<RotatingGateway> {
        &self.gateway
    }

    /// Run one batch as the thread's current generation task. A newer task
    /// for the same thread cancels this one.
    pub async fn run_batch(&self, batch: Batch) -> Result<RoundReport, EngineError> {
        let task = self.cancel.start_task(&batch.thread_id);
        self.run_started(batch, task).await
    }

    /// Run a batch under a task the caller already registered, so callers
    /// that spawn rounds can fix task order before the spawn.
    pub async fn run_started(
        &self,
        batch: Batch,
        task: GenerationTask,
    ) -> Result<RoundReport, EngineError> {
        let result = self.run_task(&batch, &task).await;
        self.cancel.finish(&task);

        match &result {
            Ok(report) => info!(
                thread_id = %batch.thread_id,
                task_id = task.task_id,
                rounds = report.rounds,
                sent = report.sent,
                tool_calls = report.tool_calls,
                elapsed_ms = task.started_at.elapsed().as_millis() as u64,
                "generation complete"
            ),
            Err(e) if e.is_cancelled() => {
                debug!(thread_id = %batch.thread_id, task_id = task.task_id, "generation cancelled")
            }
            Err(e) => warn!(
                thread_id = %batch.thread_id,
                task_id = task.task_id,
                error = %e,
                "generation failed"
            ),
        }
        result
    }

    #[instrument(skip_all, fields(thread_id = %batch.thread_id, task_id = task.task_id))]
    async fn run_task(
        &self,
        batch: &Batch,
        task: &GenerationTask,
    ) -> Result<RoundReport, EngineError> {
        let thread = &batch.thread_id;
        let pending = self.cancel.take_pending(thread);
        let prompt = match compose(batch, batch.quoted(), &pending) {
            Ok(prompt) => prompt,
            Err(e) => {
                // keep cut-off output for a batch that has something to say
                for fragment in pending {
                    self.cancel.push_pending(thread, fragment);
                }
                return Err(e.into());
            }
        };
        debug!(template = ?prompt.template, events = batch.len(), "composed prompt");

        let mut report = RoundReport {
            task_id: task.task_id,
            ..RoundReport::default()
        };
        let mut current = prompt.to_parts();
        let mut dispatched = 0usize;
        let mut last_send = None;

        for round in 0..=self.config.max_tool_rounds {
            ensure_live(task)?;
            let history = self.history.read(thread, self.config.history_budget)?;
            let request = LlmRequest::from_history(
                self.system_instruction.clone(),
                &history,
                current.clone(),
                self.config.generation.clone(),
            );
            if !current.is_empty() {
                self.history
                    .append(thread, Role::User, std::mem::take(&mut current))
                    .await?;
            }
            report.rounds = round + 1;

            let generated = tokio::select! {
                biased;
                () = task.token.cancelled() => return Err(EngineError::Cancelled),
                result = self.gateway.generate(&request) => result,
            };
            let stream = match generated {
                Ok(stream) => stream,
                Err(e) => {
                    if dispatched == 0 {
                        self.apologize(thread, &task.token).await;
                    }
                    return Err(e.into());
                }
            };

            let outcome = self
                .dispatcher
                .run(stream, batch, &task.token, last_send)
                .await;
            last_send = outcome.last_send;
            dispatched += outcome.actions;
            report.actions += outcome.actions;
            report.sent += outcome.sent.len();
            if outcome.cancelled {
                return Err(EngineError::Cancelled);
            }

            if !outcome.raw_text.trim().is_empty() {
                self.history
                    .append(thread, Role::Model, vec![ContentPart::text(outcome.raw_text.clone())])
                    .await?;
            }
            report.final_text = outcome.raw_text;

            if let Some(e) = outcome.interrupted {
                if dispatched == 0 {
                    self.apologize(thread, &task.token).await;
                }
                return Err(e.into());
            }

            if round == self.config.max_tool_rounds {
                if !find_tool_calls(&report.final_text).is_empty() {
                    warn!(
                        max_tool_rounds = self.config.max_tool_rounds,
                        "tool round limit reached, returning last round"
                    );
                }
                break;
            }

            let outcomes = self
                .tools
                .execute_all(thread, &report.final_text, &task.token)
                .await;
            ensure_live(task)?;
            if outcomes.is_empty() {
                break;
            }
            for outcome in &outcomes {
                self.history
                    .append(thread, Role::Tool, vec![outcome.to_part()])
                    .await?;
            }
            report.tool_calls += outcomes.len();
            debug!(round, calls = outcomes.len(), "tool results recorded");
        }

        Ok(report)
    }

    async fn apologize(&self, thread: &ThreadId, token: &CancellationToken) {
        if token.is_cancelled() || self.config.apology.trim().is_empty() {
            return;
        }
        let message = OutboundMessage::text(self.config.apology.clone());
        if let Err(e) = self.transport.send(thread, message).await {
            warn!(thread_id = %thread, error = %e, "failed to send apology");
        }
    }
}

fn ensure_live(task: &GenerationTask) -> Result<(), EngineError> {
    if task.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Base instruction plus the tool catalogue, if any tools are registered.
fn build_system_instruction(base: Option<&str>, tools: &ToolExecutor) -> Option<String> {
    let definitions = tools.registry().definitions();
    if definitions.is_empty() {
        return base.map(str::to_string);
    }
    let mut text = base.map(|b| format!("{b}\n\n")).unwrap_or_default();
    text.push_str(
        "Tools are available. To call one, write [tool:NAME]{json parameters}[/tool] \
         on its own; the result is returned to you before you answer.\n",
    );
    for def in definitions {
        let _ = writeln!(
            text,
            "- {}: {} Parameters: {}",
            def.name, def.description, def.parameters_schema
        );
    }
    Some(text)
}
