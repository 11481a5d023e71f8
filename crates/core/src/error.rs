//! Error types for the Windlass domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant; the model and tool
//! contexts carry their own enums so call sites can match exhaustively.

use thiserror::Error;

/// The top-level error type for all Windlass operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // --- Model backend errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Run outcomes ---
    #[error("The model produced no response")]
    NoResponse,

    #[error("No session found for id: {0}")]
    SessionNotFound(String),

    #[error("Session {0} already has a message in flight")]
    SessionBusy(String),

    #[error("The run was cancelled")]
    Cancelled,

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures from the model invocation path, already classified.
///
/// Raw backend failures (`BackendError`) are mapped into these kinds by the
/// invocation client; the rest of the system only ever sees this enum.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Request exceeds the model's context window: {0}")]
    ContextOverflow(String),

    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("Provider is overloaded: {0}")]
    Overloaded(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Billing problem: {0}")]
    Billing(String),

    #[error("No API key configured for model: {0}")]
    ApiKeyMissing(String),
}

impl ModelError {
    /// Whether the scheduler may retry this failure with backoff on the
    /// same model.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Api { .. }
                | Self::Network(_)
                | Self::RateLimited(_)
                | Self::Timeout(_)
                | Self::Overloaded(_)
        )
    }

    /// Whether this failure must propagate immediately, bypassing both
    /// retry and model rotation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Billing(_) | Self::ApiKeyMissing(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed in {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}
