use parley_core::errors::GatewayError;
use parley_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("compose error: {0}")]
    Compose(#[from] ComposeError),

    /// Superseded by a newer task for the same thread. Never shown to users.
    #[error("generation cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Gateway(GatewayError::Cancelled))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error("batch has no content to respond to")]
    EmptyBatch,
}

/// Failure of one tool invocation found in model output.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToolCallError {
    /// Rejected before execution: unknown tool, bad JSON or schema mismatch.
    #[error("invalid call to {tool}: {message}")]
    Validation { tool: String, message: String },

    /// The tool ran and failed, timed out or panicked.
    #[error("{tool} failed: {message}")]
    Execution { tool: String, message: String },
}

impl ToolCallError {
    pub fn tool(&self) -> &str {
        match self {
            Self::Validation { tool, .. } | Self::Execution { tool, .. } => tool,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation { message, .. } | Self::Execution { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_detection() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(EngineError::Gateway(GatewayError::Cancelled).is_cancelled());
        assert!(!EngineError::Gateway(GatewayError::NoCredentials).is_cancelled());
    }

    #[test]
    fn tool_call_error_accessors() {
        let err = ToolCallError::Validation {
            tool: "weather".into(),
            message: "missing required property 'city'".into(),
        };
        assert_eq!(err.tool(), "weather");
        assert!(err.to_string().contains("invalid call to weather"));
    }
}
