pub mod buffer;
pub mod cancel;
pub mod classifier;
pub mod composer;
pub mod coordinator;
pub mod directive;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod testing;
pub mod toolloop;
pub mod truncate;

pub use buffer::{IngestBuffer, IngestConfig};
pub use cancel::{CancelRegistry, GenerationTask};
pub use classifier::classify;
pub use composer::{compose, Prompt, TemplateKind};
pub use coordinator::Coordinator;
pub use directive::DirectiveParser;
pub use dispatch::{DispatchConfig, DispatchOutcome, Dispatcher};
pub use error::{ComposeError, EngineError, ToolCallError};
pub use history::{trim_to_budget, HistoryStore};
pub use pipeline::{Pipeline, PipelineConfig, RoundReport};
pub use registry::ToolRegistry;
pub use toolloop::{ToolExecutor, ToolOutcome};
