//! Error types for the execution core.
//!
//! [`ErrorKind`] is the stable, user-visible taxonomy carried on terminal
//! `plan_error` events and step errors. [`AgentError`] is the internal
//! working error on agent and tool boundaries; it maps onto a kind via
//! [`AgentError::kind`]. Errors recoverable by further reasoning are fed back
//! to the model inside the ReAct loop and never reach the stream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable user-visible error kinds (wire values are snake_case).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    SqlRejected,
    SandboxTimeout,
    SandboxRuntime,
    SandboxOversized,
    RateLimited,
    LlmError,
    Cancelled,
    BudgetExhausted,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::SqlRejected => "sql_rejected",
            ErrorKind::SandboxTimeout => "sandbox_timeout",
            ErrorKind::SandboxRuntime => "sandbox_runtime",
            ErrorKind::SandboxOversized => "sandbox_oversized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::LlmError => "llm_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Working error for agents, tools and the supervisor.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Provider call failed (transport, auth, 5xx, malformed body).
    #[error("llm provider error: {0}")]
    Llm(String),

    /// Provider asked us to back off; optional wait hint in seconds.
    #[error("llm rate limited{}", .wait_seconds.map(|s| format!(" (retry in {s}s)")).unwrap_or_default())]
    LlmRateLimited { wait_seconds: Option<u64> },

    /// The model returned output that failed structured parsing after retries.
    #[error("structured output invalid: {0}")]
    StructuredOutput(String),

    /// Turn or wall-clock budget exhausted before a terminal tool call.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    /// Process was cancelled at a checkpoint.
    #[error("cancelled")]
    Cancelled,

    /// Anything unexpected; the stream carries a redacted message, the full
    /// detail goes to the log.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Errors worth another attempt at the gateway retry layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Llm(_) | AgentError::LlmRateLimited { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Llm(_) | AgentError::StructuredOutput(_) => ErrorKind::LlmError,
            AgentError::LlmRateLimited { .. } => ErrorKind::RateLimited,
            AgentError::BudgetExhausted(_) => ErrorKind::BudgetExhausted,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Message safe to place on the event stream. Internal errors are
    /// redacted; everything else is already user-shaped.
    pub fn redacted_message(&self) -> String {
        match self {
            AgentError::Internal(_) => "an unexpected internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_snake_case() {
        assert_eq!(ErrorKind::BudgetExhausted.as_str(), "budget_exhausted");
        let v = serde_json::to_value(ErrorKind::SqlRejected).unwrap();
        assert_eq!(v, "sql_rejected");
    }

    #[test]
    fn internal_errors_are_redacted() {
        let err = AgentError::Internal("connection string user:pass@host".into());
        assert!(!err.redacted_message().contains("pass"));
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn retryable_classification() {
        assert!(AgentError::Llm("503".into()).is_retryable());
        assert!(AgentError::LlmRateLimited { wait_seconds: Some(13) }.is_retryable());
        assert!(!AgentError::Cancelled.is_retryable());
        assert!(!AgentError::StructuredOutput("bad json".into()).is_retryable());
    }
}
