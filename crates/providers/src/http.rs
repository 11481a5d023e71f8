//! OpenAI-compatible HTTP backend.
//!
//! Works with any endpoint exposing `/v1/chat/completions` semantics
//! (OpenAI, OpenRouter, Gemini's compatibility surface, Ollama, vLLM).
//!
//! Failures leave this module *raw*: the HTTP status and the provider's
//! error payload verbatim, as a [`BackendError`]. Classification into typed
//! kinds happens in the invocation client so the signature matching stays in
//! one place.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use windlass_config::AgentSettings;
use windlass_core::{
    BackendError, ModelBackend, ModelChunk, ModelError, ModelOutput, ModelRequest, Role,
    ToolCallRequest, ToolDeclaration, Usage,
};

/// An OpenAI-compatible model backend.
pub struct HttpBackend {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Build from resolved settings; fails when no API key was supplied.
    pub fn from_settings(
        name: impl Into<String>,
        base_url: impl Into<String>,
        settings: &AgentSettings,
    ) -> Result<Self, ModelError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ModelError::ApiKeyMissing(settings.model.primary.clone()))?;
        Ok(Self::new(name, base_url, api_key))
    }

    /// Convert transcript turns to the wire message format.
    fn to_api_messages(request: &ModelRequest) -> Vec<ApiMessage> {
        let mut messages = Vec::new();

        if let Some(system) = &request.system_instruction
            && !system.is_empty()
        {
            messages.push(ApiMessage {
                role: "system".into(),
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for turn in &request.turns {
            match turn.role {
                Role::User => messages.push(ApiMessage {
                    role: "user".into(),
                    content: Some(turn.text()),
                    tool_calls: None,
                    tool_call_id: None,
                }),
                Role::Model => {
                    let calls: Vec<ApiToolCall> = turn
                        .tool_calls()
                        .map(|call| ApiToolCall {
                            id: call.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: call.name.clone(),
                                arguments: call.arguments.to_string(),
                            },
                        })
                        .collect();
                    messages.push(ApiMessage {
                        role: "assistant".into(),
                        content: Some(turn.text()),
                        tool_calls: if calls.is_empty() { None } else { Some(calls) },
                        tool_call_id: None,
                    });
                }
                // One wire message per tool response part
                Role::Tool => {
                    for result in turn.tool_responses() {
                        messages.push(ApiMessage {
                            role: "tool".into(),
                            content: Some(render_blocks(result)),
                            tool_calls: None,
                            tool_call_id: Some(result.call_id.clone()),
                        });
                    }
                }
            }
        }

        messages
    }

    fn to_api_tools(tools: &[ToolDeclaration]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ModelRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request),
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        body
    }
}

fn render_blocks(result: &windlass_core::ToolResult) -> String {
    result
        .blocks
        .iter()
        .map(|block| match block {
            windlass_core::ContentBlock::Text { text } => text.clone(),
            windlass_core::ContentBlock::Json { value } => value.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a tool call's argument string. Providers occasionally emit invalid
/// JSON fragments; those are preserved as a raw string argument so the call
/// still reaches the executor (which will report the problem back to the
/// model).
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

#[async_trait]
impl ModelBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelOutput, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request, false);

        debug!(backend = %self.name, model = %request.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(BackendError::new(status, error_body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::new(200, format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::new(200, "No choices in response"))?;

        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: parse_arguments(&tc.function.arguments),
            })
            .collect();

        let usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ModelOutput {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage,
        })
    }

    async fn generate_stream(
        &self,
        request: ModelRequest,
    ) -> Result<
        tokio::sync::mpsc::Receiver<Result<ModelChunk, BackendError>>,
        BackendError,
    > {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request, true);

        debug!(backend = %self.name, model = %request.model, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(BackendError::new(status, error_body));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let backend_name = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            // Tool-call deltas accumulate here, keyed by choice index, and
            // only leave as complete calls on the final chunk.
            let mut accumulators: std::collections::BTreeMap<u32, ToolCallAccumulator> =
                std::collections::BTreeMap::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(BackendError::transport(e.to_string()))).await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();

                    if data == "[DONE]" {
                        let _ = tx.send(Ok(final_chunk(&accumulators, None))).await;
                        return;
                    }

                    match serde_json::from_str::<StreamResponse>(data) {
                        Ok(stream_resp) => {
                            if let Some(choice) = stream_resp.choices.first() {
                                if let Some(ref tc_deltas) = choice.delta.tool_calls {
                                    for tc_delta in tc_deltas {
                                        let acc =
                                            accumulators.entry(tc_delta.index).or_default();
                                        if let Some(ref id) = tc_delta.id {
                                            acc.id = id.clone();
                                        }
                                        if let Some(ref func) = tc_delta.function {
                                            if let Some(ref name) = func.name {
                                                acc.name = name.clone();
                                            }
                                            if let Some(ref args) = func.arguments {
                                                acc.arguments.push_str(args);
                                            }
                                        }
                                    }
                                }

                                if let Some(ref content) = choice.delta.content
                                    && !content.is_empty()
                                {
                                    let chunk = ModelChunk {
                                        text: Some(content.clone()),
                                        ..Default::default()
                                    };
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        return; // receiver dropped
                                    }
                                }
                            }

                            // Usage arrives on the last data frame when
                            // stream_options.include_usage is set.
                            if let Some(usage) = stream_resp.usage {
                                let usage = Usage {
                                    prompt_tokens: usage.prompt_tokens,
                                    completion_tokens: usage.completion_tokens,
                                    total_tokens: usage.total_tokens,
                                };
                                let _ = tx
                                    .send(Ok(final_chunk(&accumulators, Some(usage))))
                                    .await;
                                return;
                            }
                        }
                        Err(e) => {
                            trace!(
                                backend = %backend_name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(final_chunk(&accumulators, None))).await;
        });

        Ok(rx)
    }
}

fn final_chunk(
    accumulators: &std::collections::BTreeMap<u32, ToolCallAccumulator>,
    usage: Option<Usage>,
) -> ModelChunk {
    ModelChunk {
        text: None,
        tool_calls: accumulators.values().map(|acc| acc.to_tool_call()).collect(),
        done: true,
        usage,
    }
}

// --- Wire types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates incremental tool call deltas into a complete call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn to_tool_call(&self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: parse_arguments(&self.arguments),
        }
    }
}
