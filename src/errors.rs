//! Error taxonomy for the orchestration core.
//!
//! Every variant here corresponds to a row in the error-handling design
//! table: who raises it and how it is expected to be recovered from is
//! documented on the variant itself rather than duplicated in prose.
//! Capability boundaries (`Completer`, `Store`, tool handlers) still speak
//! `Box<dyn Error + Send + Sync>` so implementors of those traits are never
//! forced to depend on this enum.

use thiserror::Error;

/// Errors raised by the orchestrator, agent runtime, and their collaborators.
#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    /// `createAgent` or the definition loader was asked for a type with no
    /// registered constructor. Fatal to the turn.
    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    /// The declarative agent definition failed required-field validation.
    #[error("invalid agent definition for {0}: {1}")]
    InvalidDefinition(String, String),

    /// Either the per-tier or the per-agent spawn ceiling was hit. Recoverable:
    /// callers fall back to a simpler pipeline or skip an optional stage.
    #[error("agent limit reached: {0}")]
    AgentLimitReached(String),

    /// `canExecute()` observed the breaker open; fail fast without calling
    /// the agent's `run`.
    #[error("circuit breaker open for agent {0}")]
    CircuitBreakerOpen(String),

    /// An LLM call, tool call, question, or sub-agent wait exceeded its
    /// configured deadline.
    #[error("operation timed out after {0}ms: {1}")]
    Timeout(u64, String),

    /// The `Completer` exhausted its retry budget.
    #[error("llm call failed after {attempts} attempts: {last_error}")]
    LlmError {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The error message from the final attempt.
        last_error: String,
    },

    /// The agent's `tools.allowed`/`tools.restricted` policy denied the call.
    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),

    /// No tool registered under that name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A validator rejected a planned command; never fatal, the command is
    /// moved to the `blocked` list instead of propagating as an error to the
    /// turn.
    #[error("command blocked: {0}")]
    ValidationBlocked(String),

    /// A pending question or sub-agent request was evicted by its TTL
    /// without being resolved.
    #[error("pending request {0} timed out")]
    PendingRequestTimeout(String),

    /// Catch-all for collaborator failures (`Store`, transport) that don't
    /// fit a more specific variant above.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Whether `enableGracefulDegradation` should swallow this error and
    /// continue the turn rather than terminate it with a fatal `error` event.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AgentLimitReached(_)
                | OrchestratorError::CircuitBreakerOpen(_)
                | OrchestratorError::ToolNotAllowed(_)
                | OrchestratorError::UnknownTool(_)
                | OrchestratorError::ValidationBlocked(_)
                | OrchestratorError::PendingRequestTimeout(_)
        )
    }
}

/// Convenience alias used throughout the crate for boxed, thread-safe errors
/// at capability boundaries (`Completer`, `Store`, tool handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
