use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat error taxonomy shared by every agent, tool, and orchestration outcome.
/// The kind travels inside `AgentOutcome` and is what callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BudgetExceeded,
    RateLimited,
    ApiError,
    ValidationFailed,
    Timeout,
    Cancelled,
    InvalidInput,
    ToolFailed,
    Unknown,
}

impl ErrorKind {
    /// Only rate limits and upstream API errors are worth another attempt.
    /// Cancellation and budget denial must propagate untouched.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::ApiError)
    }
}

/// Engine-level error type.
/// Never crosses the agent runtime boundary as an `Err`: the harness folds it
/// into a failed `AgentOutcome` with the matching `ErrorKind`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream API error: {0}")]
    Api(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tool '{tool_id}' failed: {message}")]
    ToolFailed { tool_id: String, message: String },

    #[error("{0}")]
    Unknown(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            EngineError::RateLimited(_) => ErrorKind::RateLimited,
            EngineError::Api(_) => ErrorKind::ApiError,
            EngineError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::ToolFailed { .. } => ErrorKind::ToolFailed,
            EngineError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Categorization with fixed priority: the typed kind wins; an `Unknown`
    /// falls back to substring sniffing over the opaque upstream message.
    pub fn resolved_kind(&self) -> ErrorKind {
        match self.kind() {
            ErrorKind::Unknown => sniff_kind(&self.to_string()),
            kind => kind,
        }
    }

    /// Message suitable for end users. Budget and cancellation errors carry a
    /// fixed sanitized phrasing; API and unknown errors pass the upstream
    /// message through for debuggability.
    pub fn user_message(&self) -> String {
        match self.resolved_kind() {
            ErrorKind::BudgetExceeded => {
                "Monthly usage limit reached. Please upgrade or wait for the next cycle.".to_string()
            }
            ErrorKind::Cancelled => "The operation was cancelled.".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Maps an opaque upstream error message onto the taxonomy.
/// Checks are ordered: the more specific categories are sniffed first so that
/// e.g. "API rate limit hit" lands on RateLimited, not ApiError.
pub fn sniff_kind(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
    {
        ErrorKind::RateLimited
    } else if lower.contains("budget") || lower.contains("quota") || lower.contains("usage limit") {
        ErrorKind::BudgetExceeded
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::Timeout
    } else if lower.contains("cancel") || lower.contains("abort") {
        ErrorKind::Cancelled
    } else if lower.contains("tool") {
        ErrorKind::ToolFailed
    } else if lower.contains("api")
        || lower.contains("status 5")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("overloaded")
    {
        ErrorKind::ApiError
    } else {
        ErrorKind::Unknown
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Unknown(format!("database error: {e}"))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout(Duration::from_secs(0))
        } else {
            EngineError::Api(format!("http error: {e}"))
        }
    }
}
