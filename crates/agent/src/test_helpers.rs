//! Shared test helpers: scripted mock backends and toy tools.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use windlass_core::{
    BackendError, ModelBackend, ModelOutput, ModelRequest, Tool, ToolCallRequest, ToolError,
    ToolRegistry, ToolResult, Usage,
};

/// A mock backend that returns a sequence of scripted results.
///
/// Each call to `generate` returns the next entry in the script. Panics if
/// more calls are made than entries provided.
pub struct SequentialMockBackend {
    script: Mutex<Vec<Result<ModelOutput, BackendError>>>,
    calls: Mutex<Vec<ModelRequest>>,
}

impl SequentialMockBackend {
    pub fn new(script: Vec<Result<ModelOutput, BackendError>>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A backend that returns a single text response (no tool calls).
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![Ok(text_output(text))])
    }

    /// A backend that first requests tool calls, then answers with text.
    pub fn tool_then_answer(calls: Vec<ToolCallRequest>, answer: &str) -> Self {
        Self::new(vec![Ok(tool_call_output(calls)), Ok(text_output(answer))])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// The requests observed so far (cloned).
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for SequentialMockBackend {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelOutput, BackendError> {
        let mut calls = self.calls.lock().unwrap();
        let mut script = self.script.lock().unwrap();

        if script.is_empty() {
            panic!(
                "SequentialMockBackend: no more scripted responses (call #{})",
                calls.len() + 1
            );
        }

        calls.push(request);
        script.remove(0)
    }
}

/// A backend that always requests the same tool call: used to exercise the
/// hard iteration cap. Once asked without tools (the synthesis call), it
/// answers with text.
pub struct ToolHungryBackend {
    calls: Mutex<usize>,
    pub synthesis_answer: String,
}

impl ToolHungryBackend {
    pub fn new(synthesis_answer: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(0),
            synthesis_answer: synthesis_answer.into(),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ModelBackend for ToolHungryBackend {
    fn name(&self) -> &str {
        "tool_hungry"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelOutput, BackendError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };

        if request.tools.is_empty() {
            return Ok(text_output(&self.synthesis_answer));
        }

        Ok(tool_call_output(vec![ToolCallRequest {
            id: format!("call_{call_number}"),
            name: "echo".into(),
            arguments: serde_json::json!({"text": "again"}),
        }]))
    }
}

/// Create a plain text output with fixed usage numbers.
pub fn text_output(text: &str) -> ModelOutput {
    ModelOutput {
        text: text.into(),
        tool_calls: vec![],
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    }
}

/// Create an output requesting the given tool calls.
pub fn tool_call_output(calls: Vec<ToolCallRequest>) -> ModelOutput {
    ModelOutput {
        text: String::new(),
        tool_calls: calls,
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    }
}

/// Helper to create a tool call with a deterministic id.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args,
    }
}

// --- Toy tools ---

/// Echoes its "text" argument back.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input text"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(
        &self,
        call_id: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let text = arguments["text"].as_str().unwrap_or("").to_string();
        Ok(ToolResult::text(call_id, text))
    }
}

/// Sleeps for its "ms" argument, then reports how long it slept.
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }
    fn description(&self) -> &str {
        "Sleeps for the given number of milliseconds"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "ms": { "type": "integer" } },
            "required": ["ms"]
        })
    }
    async fn execute(
        &self,
        call_id: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ToolResult::text(call_id, format!("slept {ms}ms")))
    }
}

/// Always fails.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn execute(
        &self,
        _call_id: &str,
        _arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "failing".into(),
            reason: "intentional failure".into(),
        })
    }
}

/// A registry with all toy tools installed.
pub fn test_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    registry.register(Box::new(SleepTool));
    registry.register(Box::new(FailingTool));
    registry
}
