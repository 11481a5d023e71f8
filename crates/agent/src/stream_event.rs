//! Streaming run events.
//!
//! `RunEvent` is what the session coordinator forwards to the transport sink
//! while a run is in flight:
//! - `text_delta`: partial text from the model
//! - `tool_start`: a tool call has been identified and is about to execute
//! - `tool_end`: that call resolved (successfully or not)
//! - `done`: the run finished; carries the final answer
//! - `error`: the run failed; carries a human-readable message
//! - `cancelled`: the run was cancelled by the caller
//!
//! `done`, `error`, and `cancelled` are terminal: exactly one of them ends
//! every event stream.

use serde::{Deserialize, Serialize};
use windlass_core::{ToolCallRequest, Usage};

/// Events emitted by a streaming run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Partial text from the model.
    TextDelta { content: String },

    /// A tool call is about to execute.
    ToolStart {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// A tool call resolved.
    ToolEnd {
        id: String,
        name: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The run completed: final answer and run metadata.
    Done {
        message: String,
        tool_calls: Vec<ToolCallRequest>,
        usage: Option<Usage>,
        iterations: u32,
        model_used: Option<String>,
    },

    /// The run failed.
    Error { message: String },

    /// The run was cancelled by the caller.
    Cancelled,
}

impl RunEvent {
    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. } | Self::Cancelled)
    }
}
