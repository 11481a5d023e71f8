//! Conversation turn domain types.
//!
//! A transcript is an ordered list of role-tagged turns; each turn is made of
//! parts: plain text, a tool call requested by the model, or the response to
//! a tool call. These are the value objects that flow through the entire
//! system: user message in → model turns and tool turns appended → final
//! answer out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a turn in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The language model
    Model,
    /// Tool execution results
    Tool,
}

/// A structured request, emitted by the model, to execute a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique call ID within one run
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// One block of tool output content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Json { value: serde_json::Value },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// The result of one tool execution.
///
/// A failed or timed-out call is still a result: the failure is carried in
/// `error` so the model can see it and recover, instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Output content blocks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<ContentBlock>,

    /// Set when the call failed or timed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Optional structured diagnostics (timings, provider metadata)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolResult {
    /// A successful result with a single text block.
    pub fn text(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            blocks: vec![ContentBlock::text(text)],
            error: None,
            details: None,
        }
    }

    /// A failed result. The message is also surfaced as a text block so the
    /// model sees something to react to.
    pub fn error(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            call_id: call_id.into(),
            blocks: vec![ContentBlock::text(format!("Error: {message}"))],
            error: Some(message),
            details: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One part of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    /// Plain text content
    Text { text: String },

    /// A tool call requested by the model
    ToolCall { call: ToolCallRequest },

    /// The response to a previously issued tool call
    ToolResponse { result: ToolResult },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    /// The tool call id this part carries, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call } => Some(&call.id),
            Self::ToolResponse { result } => Some(&result.call_id),
            Self::Text { .. } => None,
        }
    }
}

/// A single role-tagged unit of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced this turn
    pub role: Role,

    /// The ordered parts of the turn
    pub parts: Vec<Part>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Create a user turn carrying plain text.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
            timestamp: Utc::now(),
        }
    }

    /// Create a model turn carrying plain text.
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
            timestamp: Utc::now(),
        }
    }

    /// Create a model turn carrying tool calls, optionally preceded by text.
    pub fn model_tool_calls(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = text
            && !text.is_empty()
        {
            parts.push(Part::text(text));
        }
        parts.extend(calls.into_iter().map(|call| Part::ToolCall { call }));
        Self {
            role: Role::Model,
            parts,
            timestamp: Utc::now(),
        }
    }

    /// Create a tool turn carrying execution results.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::Tool,
            parts: results
                .into_iter()
                .map(|result| Part::ToolResponse { result })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this turn carries any tool call or tool response parts.
    pub fn has_tool_parts(&self) -> bool {
        self.parts.iter().any(|p| !p.is_text())
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Iterate the tool calls in this turn.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRequest> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall { call } => Some(call),
            _ => None,
        })
    }

    /// Iterate the tool responses in this turn.
    pub fn tool_responses(&self) -> impl Iterator<Item = &ToolResult> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolResponse { result } => Some(result),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_turn() {
        let turn = Turn::user("Hello, agent!");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.text(), "Hello, agent!");
        assert!(!turn.has_tool_parts());
    }

    #[test]
    fn model_turn_with_tool_calls() {
        let call = ToolCallRequest::new("web_search", serde_json::json!({"query": "rust"}));
        let turn = Turn::model_tool_calls(Some("Let me look that up".into()), vec![call]);
        assert_eq!(turn.role, Role::Model);
        assert!(turn.has_tool_parts());
        assert_eq!(turn.tool_calls().count(), 1);
        assert_eq!(turn.text(), "Let me look that up");
    }

    #[test]
    fn empty_text_is_omitted_from_tool_call_turn() {
        let call = ToolCallRequest::new("calculator", serde_json::json!({"expr": "1+1"}));
        let turn = Turn::model_tool_calls(Some(String::new()), vec![call]);
        assert_eq!(turn.parts.len(), 1);
        assert!(turn.text().is_empty());
    }

    #[test]
    fn tool_turn_carries_results_in_order() {
        let turn = Turn::tool_results(vec![
            ToolResult::text("call_a", "first"),
            ToolResult::error("call_b", "boom"),
        ]);
        assert_eq!(turn.role, Role::Tool);
        let results: Vec<_> = turn.tool_responses().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].call_id, "call_a");
        assert!(results[1].is_error());
    }

    #[test]
    fn error_result_surfaces_message_as_text() {
        let result = ToolResult::error("call_1", "connection refused");
        assert!(result.is_error());
        match &result.blocks[0] {
            ContentBlock::Text { text } => assert!(text.contains("connection refused")),
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn turn_serialization_roundtrip() {
        let call = ToolCallRequest::new("shell", serde_json::json!({"command": "ls"}));
        let turn = Turn::model_tool_calls(None, vec![call]);
        let json = serde_json::to_string(&turn).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
        assert!(json.contains(r#""kind":"tool_call""#));
    }

    #[test]
    fn part_call_id_lookup() {
        let call = ToolCallRequest::new("echo", serde_json::json!({}));
        let id = call.id.clone();
        let part = Part::ToolCall { call };
        assert_eq!(part.call_id(), Some(id.as_str()));
        assert_eq!(Part::text("hi").call_id(), None);
    }
}
