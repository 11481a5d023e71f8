//! Model backend trait: the abstraction over LLM providers.
//!
//! A backend knows how to send a transcript to a model and get a generation
//! back, either complete or as a stream of chunks. Backends report failures
//! *raw* ([`BackendError`]: status code plus the provider's message); turning
//! those into typed error kinds is the invocation client's job, so the
//! mapping stays a pure function that can be tested without a wire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::turn::{ToolCallRequest, Turn};

/// A tool declaration sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// One fully-specified generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The model to use (e.g. "gemini-2.0-flash", "gpt-4o")
    pub model: String,

    /// System instruction prepended to the conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    /// The transcript turns, oldest first
    pub turns: Vec<Turn>,

    /// Tools the model is allowed to call this iteration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,
}

/// Token usage statistics for one or more generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Fold another generation's usage into this accumulator.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A complete (non-streaming) generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Generated text (may be empty when the model only calls tools)
    #[serde(default)]
    pub text: String,

    /// Tool calls the model wants executed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// Token usage, when the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A single chunk in a streaming generation.
///
/// Tool calls arrive complete, on the chunk that carries `done`: backends
/// accumulate any incremental argument deltas internally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelChunk {
    /// Partial text delta
    #[serde(default)]
    pub text: Option<String>,

    /// Complete tool calls (only populated on the final chunk)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only on the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A raw, unclassified backend failure.
///
/// Carries whatever the provider surfaced: an HTTP status when there was
/// one, and the error payload or transport message verbatim.
#[derive(Debug, Clone)]
pub struct BackendError {
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(status: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }

    /// A transport-level failure with no HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "backend error (status {status}): {}", self.message),
            None => write!(f, "backend error: {}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// The model backend trait.
///
/// Every provider (OpenAI-compatible endpoints, test doubles) implements
/// this. The orchestration layers call `generate` or `generate_stream`
/// without knowing which backend answers: pure polymorphism.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Send a request and get a complete generation.
    async fn generate(
        &self,
        request: ModelRequest,
    ) -> std::result::Result<ModelOutput, BackendError>;

    /// Send a request and get a stream of chunks.
    ///
    /// Default implementation calls `generate()` and wraps the result as a
    /// single final chunk.
    async fn generate_stream(
        &self,
        request: ModelRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<ModelChunk, BackendError>>,
        BackendError,
    > {
        let output = self.generate(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(ModelChunk {
                text: Some(output.text),
                tool_calls: output.tool_calls,
                done: true,
                usage: output.usage,
            }))
            .await;
        Ok(rx)
    }
}
