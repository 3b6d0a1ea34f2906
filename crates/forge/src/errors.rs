use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to callers of the router and the agent runtime
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForgeError {
    /// No usable provider, or a malformed `provider/model` string. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    /// A delegated credential is missing and could not be refreshed
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Agent loop exceeded max iterations ({0})")]
    IterationBudgetExceeded(usize),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Template error: {0}")]
    Template(String),
}

impl ForgeError {
    pub fn provider<P: Into<String>, M: std::fmt::Display>(provider: P, message: M) -> Self {
        ForgeError::Provider {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ForgeError::Cancelled)
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;

/// Errors reported by an external tool executor. These never abort a turn;
/// the agent folds them into the tool result it hands back to the model.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool execution cancelled")]
    Cancelled,
}

pub type ToolResult<T> = Result<T, ToolError>;
