//! The iteration orchestrator: the bounded model/tool turn loop.
//!
//! One run alternates model calls and tool execution until the model answers
//! with plain text, a failure propagates, or the iteration caps intervene:
//!
//! 1. **Repair** the transcript, then invoke the scheduler (which already
//!    handles retry and fallback rotation). A `ContextOverflow` that survives
//!    rotation triggers transcript compaction and a bounded re-invoke.
//! 2. Tool calls in the output run concurrently; their results are appended
//!    in request order and the loop continues.
//! 3. Past the soft threshold the system instruction carries a budget notice
//!    nudging the model to wrap up. At the hard cap the loop stops offering
//!    tools and issues exactly one tool-less synthesis call.
//!
//! The streaming variant walks the same loop but delivers partial text as
//! `text_delta` events and surfaces tool execution as `tool_start`/`tool_end`
//! pairs. Cancellation is cooperative: the token is checked at loop
//! boundaries and in-flight tool results are discarded, with the result
//! guard closing the transcript off validly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use windlass_config::LoopConfig;
use windlass_core::{
    ContentBlock, Error, ModelError, ModelRequest, ToolCallRequest, ToolDeclaration, ToolRegistry,
    ToolResult, Turn, Usage,
};
use windlass_providers::{ModelScheduler, ScheduledOutput, ScheduledStream};

use crate::executor::{ToolExecutor, ToolResultGuard};
use crate::stream_event::RunEvent;
use crate::transcript::{CompactionPolicy, Transcript};

/// One inbound message for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The user's message.
    pub message: String,

    /// Which agent configuration produced this request (observability only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Prior conversation turns, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Turn>>,

    /// Whether tools may be offered to the model.
    #[serde(default = "default_enable_tools")]
    pub enable_tools: bool,
}

fn default_enable_tools() -> bool {
    true
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            agent_id: None,
            history: None,
            enable_tools: true,
        }
    }
}

/// The batch response for one processed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

/// Everything one completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_results: Vec<ToolResult>,
    pub usage: Usage,
    pub iterations: u32,
    pub model_used: Option<String>,
}

/// Bookkeeping owned by exactly one run, discarded when it ends.
#[derive(Default)]
struct IterationState {
    index: u32,
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    tool_results: Vec<ToolResult>,
    usage: Usage,
    tool_use_counts: BTreeMap<String, u32>,
    model_used: Option<String>,
}

impl IterationState {
    fn record_usage(&mut self, usage: Option<&Usage>) {
        if let Some(usage) = usage {
            self.usage.add(usage);
        }
    }

    fn record_calls(&mut self, calls: &[ToolCallRequest]) {
        for call in calls {
            *self.tool_use_counts.entry(call.name.clone()).or_default() += 1;
        }
        self.tool_calls.extend(calls.iter().cloned());
    }

    fn tool_summary(&self) -> String {
        if self.tool_use_counts.is_empty() {
            return "no tools used yet".into();
        }
        self.tool_use_counts
            .iter()
            .map(|(name, count)| format!("{name} x{count}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            text: self.text,
            tool_calls: self.tool_calls,
            tool_results: self.tool_results,
            usage: self.usage,
            iterations: self.index,
            model_used: self.model_used,
        }
    }
}

/// The turn-loop orchestrator for one agent configuration.
#[derive(Clone)]
pub struct Orchestrator {
    scheduler: Arc<ModelScheduler>,
    tools: Arc<ToolRegistry>,
    system_instruction: String,
    limits: LoopConfig,
    compaction: CompactionPolicy,
}

impl Orchestrator {
    pub fn new(scheduler: Arc<ModelScheduler>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            scheduler,
            tools,
            system_instruction: String::new(),
            limits: LoopConfig::default(),
            compaction: CompactionPolicy::default(),
        }
    }

    /// Set the base system instruction.
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Set the loop bounds (iteration caps, compaction attempts, tool timeout).
    pub fn with_limits(mut self, limits: LoopConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Override the overflow compaction policy.
    pub fn with_compaction_policy(mut self, policy: CompactionPolicy) -> Self {
        self.compaction = policy;
        self
    }

    fn declarations(&self, enable_tools: bool) -> Vec<ToolDeclaration> {
        if enable_tools {
            self.tools.declarations()
        } else {
            Vec::new()
        }
    }

    /// The system instruction for a given iteration. Past the soft threshold
    /// it carries a budget notice so the model starts wrapping up.
    fn system_for(&self, iteration: u32, state: &IterationState) -> Option<String> {
        let base = (!self.system_instruction.is_empty()).then(|| self.system_instruction.clone());
        if iteration <= self.limits.soft_iteration_threshold {
            return base;
        }

        let remaining = self.limits.hard_iteration_cap.saturating_sub(iteration);
        let notice = format!(
            "Note on budget: at most {remaining} more tool iteration(s) are available in this \
             exchange ({}). Prefer a direct answer over further tool calls.",
            state.tool_summary()
        );
        Some(match base {
            Some(base) => format!("{base}\n\n{notice}"),
            None => notice,
        })
    }

    /// The system instruction for the final tool-less synthesis call.
    fn synthesis_system(&self, state: &IterationState) -> Option<String> {
        let notice = format!(
            "The tool budget for this exchange is exhausted ({}). Summarize what the tool \
             results establish and answer the user directly; no further tools are available.",
            state.tool_summary()
        );
        Some(if self.system_instruction.is_empty() {
            notice
        } else {
            format!("{}\n\n{notice}", self.system_instruction)
        })
    }

    /// Invoke the scheduler; on overflow that survived fallback rotation,
    /// compact the transcript and retry, bounded by the configured attempts.
    async fn call_with_compaction(
        &self,
        transcript: &mut Transcript,
        system: Option<String>,
        tools: &[ToolDeclaration],
    ) -> Result<ScheduledOutput, Error> {
        let mut attempts = 0u32;
        loop {
            let request = self.build_request(transcript, system.clone(), tools);
            match self.scheduler.invoke(&request).await {
                Ok(output) => return Ok(output),
                Err(ModelError::ContextOverflow(message)) => {
                    attempts += 1;
                    if attempts > self.limits.max_compaction_attempts {
                        warn!(attempts, "Compaction attempts exhausted, surfacing overflow");
                        return Err(ModelError::ContextOverflow(message).into());
                    }
                    info!(attempt = attempts, turns = transcript.len(), "Context overflow after fallback exhaustion, compacting");
                    if !transcript.compact(&self.compaction) {
                        warn!("Transcript cannot shrink further, surfacing overflow");
                        return Err(ModelError::ContextOverflow(message).into());
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Streaming twin of [`call_with_compaction`]: policy applies at stream
    /// establishment.
    async fn open_stream_with_compaction(
        &self,
        transcript: &mut Transcript,
        system: Option<String>,
        tools: &[ToolDeclaration],
    ) -> Result<ScheduledStream, Error> {
        let mut attempts = 0u32;
        loop {
            let request = self.build_request(transcript, system.clone(), tools);
            match self.scheduler.invoke_stream(&request).await {
                Ok(stream) => return Ok(stream),
                Err(ModelError::ContextOverflow(message)) => {
                    attempts += 1;
                    if attempts > self.limits.max_compaction_attempts {
                        return Err(ModelError::ContextOverflow(message).into());
                    }
                    info!(attempt = attempts, "Context overflow on stream open, compacting");
                    if !transcript.compact(&self.compaction) {
                        return Err(ModelError::ContextOverflow(message).into());
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn build_request(
        &self,
        transcript: &Transcript,
        system: Option<String>,
        tools: &[ToolDeclaration],
    ) -> ModelRequest {
        ModelRequest {
            // The scheduler assigns the concrete model per rotation.
            model: String::new(),
            system_instruction: system,
            turns: transcript.turns().to_vec(),
            tools: tools.to_vec(),
        }
    }

    /// Process one request and return the complete response.
    pub async fn respond(&self, request: ChatRequest) -> Result<AgentResponse, Error> {
        if let Some(agent_id) = &request.agent_id {
            debug!(agent_id = %agent_id, "Processing message");
        }
        let mut transcript = Transcript::from_turns(request.history.unwrap_or_default());
        transcript.push(Turn::user(&request.message));

        let outcome = self.run_with_tools(&mut transcript, request.enable_tools).await?;
        Ok(AgentResponse {
            message: outcome.text,
            tool_calls: outcome.tool_calls,
            tool_results: outcome.tool_results,
        })
    }

    /// Run the loop over an existing transcript (tools enabled).
    pub async fn run(&self, transcript: &mut Transcript) -> Result<RunOutcome, Error> {
        self.run_with_tools(transcript, true).await
    }

    async fn run_with_tools(
        &self,
        transcript: &mut Transcript,
        enable_tools: bool,
    ) -> Result<RunOutcome, Error> {
        let declarations = self.declarations(enable_tools);
        let executor = ToolExecutor::new(self.tools.clone(), self.limits.tool_timeout());
        let guard = ToolResultGuard::new();
        let mut state = IterationState::default();

        info!(
            cap = self.limits.hard_iteration_cap,
            tools = declarations.len(),
            "Run starting"
        );

        while state.index < self.limits.hard_iteration_cap {
            state.index += 1;
            transcript.repair();

            let system = self.system_for(state.index, &state);
            let scheduled = self
                .call_with_compaction(transcript, system, &declarations)
                .await?;
            state.model_used = Some(scheduled.model_used);
            state.record_usage(scheduled.output.usage.as_ref());
            let output = scheduled.output;

            if output.tool_calls.is_empty() {
                if output.text.is_empty() && state.tool_calls.is_empty() {
                    return Err(Error::NoResponse);
                }
                transcript.push(Turn::model(output.text.clone()));
                state.text = output.text;
                info!(
                    iterations = state.index,
                    tool_calls = state.tool_calls.len(),
                    "Run completed"
                );
                return Ok(state.into_outcome());
            }

            debug!(
                iteration = state.index,
                count = output.tool_calls.len(),
                "Executing tool calls"
            );
            transcript.push(Turn::model_tool_calls(
                Some(output.text.clone()),
                output.tool_calls.clone(),
            ));
            state.record_calls(&output.tool_calls);

            let results = executor.execute_all(&output.tool_calls, &guard).await;
            transcript.push(Turn::tool_results(results.clone()));
            state.tool_results.extend(results);
        }

        if state.tool_calls.is_empty() {
            return Err(Error::NoResponse);
        }

        // Hard cap reached without a plain-text answer: one tool-less
        // synthesis call over the gathered results.
        warn!(
            cap = self.limits.hard_iteration_cap,
            "Hard iteration cap reached, requesting final synthesis"
        );
        transcript.repair();
        let system = self.synthesis_system(&state);
        let scheduled = self.call_with_compaction(transcript, system, &[]).await?;
        state.model_used = Some(scheduled.model_used);
        state.record_usage(scheduled.output.usage.as_ref());

        // Whatever came back is the answer, even if empty.
        transcript.push(Turn::model(scheduled.output.text.clone()));
        state.text = scheduled.output.text;
        Ok(state.into_outcome())
    }

    /// Process one request as an event stream.
    ///
    /// The loop runs as a background task; events arrive on the returned
    /// receiver. Cancellation via the token stops the run cooperatively;
    /// the task itself emits no terminal event for that case, the session
    /// coordinator owns the single `cancelled` event.
    pub fn run_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(128);
        let this = self.clone();
        tokio::spawn(async move {
            this.stream_inner(request, tx, cancel).await;
        });
        rx
    }

    async fn stream_inner(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) {
        let mut transcript = Transcript::from_turns(request.history.unwrap_or_default());
        transcript.push(Turn::user(&request.message));

        let declarations = self.declarations(request.enable_tools);
        let executor = ToolExecutor::new(self.tools.clone(), self.limits.tool_timeout());
        let guard = Arc::new(ToolResultGuard::new());
        let mut state = IterationState::default();

        while state.index < self.limits.hard_iteration_cap {
            if cancel.is_cancelled() {
                self.close_cancelled(&mut transcript, &guard);
                return;
            }
            state.index += 1;
            transcript.repair();

            let system = self.system_for(state.index, &state);
            let stream = match self
                .open_stream_with_compaction(&mut transcript, system, &declarations)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = tx
                        .send(RunEvent::Error {
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
            };
            state.model_used = Some(stream.model_used.clone());

            let (text, tool_calls) =
                match self.read_stream(stream, &tx, &cancel, &mut state).await {
                    StreamRead::Completed { text, tool_calls } => (text, tool_calls),
                    StreamRead::Cancelled => {
                        self.close_cancelled(&mut transcript, &guard);
                        return;
                    }
                    StreamRead::Failed => return,
                };

            if tool_calls.is_empty() {
                if text.is_empty() && state.tool_calls.is_empty() {
                    let _ = tx
                        .send(RunEvent::Error {
                            message: Error::NoResponse.to_string(),
                        })
                        .await;
                    return;
                }
                transcript.push(Turn::model(text.clone()));
                state.text = text;
                self.send_done(&tx, &state).await;
                return;
            }

            transcript.push(Turn::model_tool_calls(Some(text), tool_calls.clone()));
            state.record_calls(&tool_calls);

            for call in &tool_calls {
                if tx
                    .send(RunEvent::ToolStart {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }

            guard.register(tool_calls.iter().map(|c| c.id.clone()));

            // Each call runs as its own task so a cooperative cancel does
            // not kill in-flight executions: their results are simply
            // discarded. `tool_end` fires per call as it resolves.
            let handles: Vec<_> = tool_calls
                .iter()
                .cloned()
                .map(|call| {
                    let executor = executor.clone();
                    let guard = guard.clone();
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let result = executor.execute_one(&call).await;
                        guard.resolve(&result.call_id);
                        if !cancel.is_cancelled() {
                            let _ = tx
                                .send(RunEvent::ToolEnd {
                                    id: result.call_id.clone(),
                                    name: call.name.clone(),
                                    output: render_output(&result),
                                    error: result.error.clone(),
                                })
                                .await;
                        }
                        result
                    })
                })
                .collect();

            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    self.close_cancelled(&mut transcript, &guard);
                    return;
                }
                joined = futures::future::join_all(handles) => joined,
            };

            let results: Vec<ToolResult> = joined
                .into_iter()
                .zip(tool_calls.iter())
                .map(|(joined, call)| {
                    joined.unwrap_or_else(|e| {
                        ToolResult::error(&call.id, format!("tool task failed: {e}"))
                    })
                })
                .collect();

            transcript.push(Turn::tool_results(results.clone()));
            state.tool_results.extend(results);
        }

        if state.tool_calls.is_empty() {
            let _ = tx
                .send(RunEvent::Error {
                    message: Error::NoResponse.to_string(),
                })
                .await;
            return;
        }

        // Final tool-less synthesis, streamed like any other model call.
        warn!(
            cap = self.limits.hard_iteration_cap,
            "Hard iteration cap reached, requesting final synthesis"
        );
        transcript.repair();
        let system = self.synthesis_system(&state);
        let stream = match self
            .open_stream_with_compaction(&mut transcript, system, &[])
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let _ = tx
                    .send(RunEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
        };
        state.model_used = Some(stream.model_used.clone());

        match self.read_stream(stream, &tx, &cancel, &mut state).await {
            StreamRead::Completed { text, .. } => {
                transcript.push(Turn::model(text.clone()));
                state.text = text;
                self.send_done(&tx, &state).await;
            }
            StreamRead::Cancelled => {
                self.close_cancelled(&mut transcript, &guard);
            }
            StreamRead::Failed => {}
        }
    }

    /// Drain one model stream, forwarding text deltas as events.
    async fn read_stream(
        &self,
        mut stream: ScheduledStream,
        tx: &mpsc::Sender<RunEvent>,
        cancel: &CancellationToken,
        state: &mut IterationState,
    ) -> StreamRead {
        let mut text = String::new();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StreamRead::Cancelled,
                chunk = stream.chunks.recv() => match chunk {
                    None => break,
                    Some(Ok(chunk)) => {
                        if let Some(delta) = chunk.text
                            && !delta.is_empty()
                        {
                            text.push_str(&delta);
                            if tx.send(RunEvent::TextDelta { content: delta }).await.is_err() {
                                return StreamRead::Failed;
                            }
                        }
                        tool_calls.extend(chunk.tool_calls);
                        if let Some(usage) = chunk.usage {
                            state.usage.add(&usage);
                        }
                        if chunk.done {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(RunEvent::Error { message: err.to_string() }).await;
                        return StreamRead::Failed;
                    }
                },
            }
        }

        StreamRead::Completed { text, tool_calls }
    }

    async fn send_done(&self, tx: &mpsc::Sender<RunEvent>, state: &IterationState) {
        info!(
            iterations = state.index,
            tool_calls = state.tool_calls.len(),
            "Streaming run completed"
        );
        let _ = tx
            .send(RunEvent::Done {
                message: state.text.clone(),
                tool_calls: state.tool_calls.clone(),
                usage: Some(state.usage),
                iterations: state.index,
                model_used: state.model_used.clone(),
            })
            .await;
    }

    /// Close the transcript after a cooperative cancel: any still-pending
    /// tool call gets a synthesized error response so the transcript stays
    /// structurally valid for whoever reuses it.
    fn close_cancelled(&self, transcript: &mut Transcript, guard: &ToolResultGuard) {
        info!("Run cancelled, closing transcript");
        let placeholders = guard.flush();
        if !placeholders.is_empty() {
            transcript.push(Turn::tool_results(placeholders));
        }
    }
}

enum StreamRead {
    Completed {
        text: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    Cancelled,
    Failed,
}

fn render_output(result: &ToolResult) -> String {
    result
        .blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Json { value } => value.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use windlass_core::{BackendError, ModelBackend, ModelChunk, ModelOutput, Role};
    use windlass_providers::scheduler_with_defaults;

    fn orchestrator_with(backend: Arc<dyn ModelBackend>) -> Orchestrator {
        let scheduler = Arc::new(scheduler_with_defaults(backend, "primary-model", vec![]));
        Orchestrator::new(scheduler, Arc::new(test_registry()))
            .with_system_instruction("You are a test agent")
    }

    #[tokio::test]
    async fn simple_text_response() {
        let backend = Arc::new(SequentialMockBackend::single_text("Hello! How can I help?"));
        let orchestrator = orchestrator_with(backend);

        let response = orchestrator
            .respond(ChatRequest::new("Hello!"))
            .await
            .unwrap();
        assert_eq!(response.message, "Hello! How can I help?");
        assert!(response.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn two_tool_calls_then_answer() {
        // Iteration 1: two tool calls. Iteration 2: plain text.
        let calls = vec![
            make_tool_call("echo", serde_json::json!({"text": "alpha"})),
            make_tool_call("sleep", serde_json::json!({"ms": 10})),
        ];
        let backend = Arc::new(SequentialMockBackend::tool_then_answer(
            calls,
            "Both tools are done.",
        ));
        let orchestrator = orchestrator_with(backend.clone());

        let response = orchestrator
            .respond(ChatRequest::new("Run both tools"))
            .await
            .unwrap();

        assert_eq!(response.message, "Both tools are done.");
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_results.len(), 2);
        // Results in request order
        assert_eq!(response.tool_results[0].call_id, "call_echo");
        assert_eq!(response.tool_results[1].call_id, "call_sleep");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn tool_results_reach_the_next_model_call() {
        let calls = vec![make_tool_call("echo", serde_json::json!({"text": "payload"}))];
        let backend = Arc::new(SequentialMockBackend::tool_then_answer(calls, "Done"));
        let orchestrator = orchestrator_with(backend.clone());

        orchestrator
            .respond(ChatRequest::new("go"))
            .await
            .unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        // Second call's transcript carries user, model(calls), tool results
        let turns = &requests[1].turns;
        assert_eq!(turns[0].role, Role::User);
        assert!(turns[1].has_tool_parts());
        assert_eq!(turns[2].role, Role::Tool);
        let result = turns[2].tool_responses().next().unwrap();
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn orphaned_history_is_repaired_before_the_call() {
        let backend = Arc::new(SequentialMockBackend::single_text("ok"));
        let orchestrator = orchestrator_with(backend.clone());

        // History ends with a model turn whose call never got a response.
        let history = vec![
            Turn::user("earlier question"),
            Turn::model_tool_calls(
                None,
                vec![ToolCallRequest {
                    id: "call_lost".into(),
                    name: "echo".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
        ];

        let mut request = ChatRequest::new("follow-up");
        request.history = Some(history);
        orchestrator.respond(request).await.unwrap();

        let sent = backend.requests();
        let turns = &sent[0].turns;
        // The orphan got a synthetic response before the model saw it.
        let responded: Vec<_> = turns
            .iter()
            .flat_map(|t| t.tool_responses())
            .map(|r| r.call_id.clone())
            .collect();
        assert!(responded.contains(&"call_lost".to_string()));
    }

    #[tokio::test]
    async fn empty_output_is_no_response() {
        let backend = Arc::new(SequentialMockBackend::new(vec![Ok(ModelOutput::default())]));
        let orchestrator = orchestrator_with(backend);

        let err = orchestrator
            .respond(ChatRequest::new("hello?"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResponse));
    }

    #[tokio::test]
    async fn hard_cap_triggers_single_synthesis_call() {
        let backend = Arc::new(ToolHungryBackend::new("Summary of everything gathered."));
        let mut limits = LoopConfig::default();
        limits.hard_iteration_cap = 3;
        limits.soft_iteration_threshold = 2;

        let scheduler = Arc::new(scheduler_with_defaults(
            backend.clone(),
            "primary-model",
            vec![],
        ));
        let orchestrator =
            Orchestrator::new(scheduler, Arc::new(test_registry())).with_limits(limits);

        let response = orchestrator
            .respond(ChatRequest::new("loop forever"))
            .await
            .unwrap();

        // 3 tool iterations + exactly 1 tool-less synthesis call
        assert_eq!(backend.call_count(), 4);
        assert_eq!(response.message, "Summary of everything gathered.");
        assert_eq!(response.tool_calls.len(), 3);
    }

    #[tokio::test]
    async fn soft_threshold_adds_budget_notice() {
        let calls = vec![make_tool_call("echo", serde_json::json!({"text": "x"}))];
        let backend = Arc::new(SequentialMockBackend::tool_then_answer(calls, "done"));

        let mut limits = LoopConfig::default();
        limits.soft_iteration_threshold = 1;
        let scheduler = Arc::new(scheduler_with_defaults(
            backend.clone(),
            "primary-model",
            vec![],
        ));
        let orchestrator = Orchestrator::new(scheduler, Arc::new(test_registry()))
            .with_system_instruction("Base instruction")
            .with_limits(limits);

        orchestrator.respond(ChatRequest::new("go")).await.unwrap();

        let requests = backend.requests();
        let first = requests[0].system_instruction.as_deref().unwrap();
        let second = requests[1].system_instruction.as_deref().unwrap();
        assert!(!first.contains("budget"));
        assert!(second.contains("Base instruction"));
        assert!(second.contains("budget"));
        assert!(second.contains("echo x1"));
    }

    #[tokio::test]
    async fn overflow_compacts_then_retries() {
        let backend = Arc::new(SequentialMockBackend::new(vec![
            Err(BackendError::new(400, "maximum context length exceeded")),
            Ok(text_output("fits now")),
        ]));
        let orchestrator = orchestrator_with(backend.clone());

        let mut request = ChatRequest::new("current question");
        request.history = Some(vec![
            Turn::user("old q1"),
            Turn::model("old a1"),
            Turn::user("old q2"),
            Turn::model("old a2"),
        ]);

        let response = orchestrator.respond(request).await.unwrap();
        assert_eq!(response.message, "fits now");
        assert_eq!(backend.call_count(), 2);

        // The retried call saw a shorter transcript.
        let requests = backend.requests();
        assert!(requests[1].turns.len() < requests[0].turns.len());
    }

    #[tokio::test]
    async fn compaction_attempts_are_bounded() {
        struct AlwaysOverflow;

        #[async_trait]
        impl ModelBackend for AlwaysOverflow {
            fn name(&self) -> &str {
                "always_overflow"
            }
            async fn generate(
                &self,
                _request: ModelRequest,
            ) -> Result<ModelOutput, BackendError> {
                Err(BackendError::new(400, "maximum context length exceeded"))
            }
        }

        let mut limits = LoopConfig::default();
        limits.max_compaction_attempts = 2;
        let scheduler = Arc::new(scheduler_with_defaults(
            Arc::new(AlwaysOverflow),
            "primary-model",
            vec![],
        ));
        let orchestrator =
            Orchestrator::new(scheduler, Arc::new(test_registry())).with_limits(limits);

        let mut request = ChatRequest::new("current");
        request.history = Some(vec![
            Turn::user("q1"),
            Turn::model("a1"),
            Turn::user("q2"),
            Turn::model("a2"),
            Turn::user("q3"),
            Turn::model("a3"),
        ]);

        let err = orchestrator.respond(request).await.unwrap_err();
        assert!(matches!(err, Error::Model(ModelError::ContextOverflow(_))));
    }

    #[tokio::test]
    async fn fallback_is_tried_before_compaction() {
        struct OverflowOnPrimary;

        #[async_trait]
        impl ModelBackend for OverflowOnPrimary {
            fn name(&self) -> &str {
                "overflow_on_primary"
            }
            async fn generate(&self, request: ModelRequest) -> Result<ModelOutput, BackendError> {
                if request.model == "primary-model" {
                    Err(BackendError::new(400, "maximum context length exceeded"))
                } else {
                    Ok(ModelOutput {
                        text: "from big model".into(),
                        tool_calls: vec![],
                        usage: None,
                    })
                }
            }
        }

        let scheduler = Arc::new(scheduler_with_defaults(
            Arc::new(OverflowOnPrimary),
            "primary-model",
            vec!["big-context-model".into()],
        ));
        let orchestrator = Orchestrator::new(scheduler, Arc::new(test_registry()));

        let mut transcript = Transcript::new();
        transcript.push(Turn::user("long question"));
        let before = transcript.len();

        let outcome = orchestrator.run(&mut transcript).await.unwrap();
        assert_eq!(outcome.model_used.as_deref(), Some("big-context-model"));
        // No compaction happened: nothing was trimmed from the transcript.
        assert_eq!(transcript.turns()[0].text(), "long question");
        assert_eq!(transcript.len(), before + 1); // only the answer appended
    }

    #[tokio::test]
    async fn disabled_tools_are_not_offered() {
        let backend = Arc::new(SequentialMockBackend::single_text("no tools involved"));
        let orchestrator = orchestrator_with(backend.clone());

        let mut request = ChatRequest::new("hi");
        request.enable_tools = false;
        orchestrator.respond(request).await.unwrap();

        assert!(backend.requests()[0].tools.is_empty());
    }

    // --- Streaming ---

    /// Collect all events until the channel closes.
    async fn collect_events(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn stream_simple_text() {
        let backend = Arc::new(SequentialMockBackend::single_text("Final answer"));
        let orchestrator = orchestrator_with(backend);

        let rx = orchestrator.run_stream(ChatRequest::new("Hello"), CancellationToken::new());
        let events = collect_events(rx).await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::TextDelta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Final answer");

        match events.last().unwrap() {
            RunEvent::Done {
                message,
                iterations,
                ..
            } => {
                assert_eq!(message, "Final answer");
                assert_eq!(*iterations, 1);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_surfaces_tool_lifecycle() {
        let calls = vec![
            make_tool_call("echo", serde_json::json!({"text": "alpha"})),
            make_tool_call("sleep", serde_json::json!({"ms": 5})),
        ];
        let backend = Arc::new(SequentialMockBackend::tool_then_answer(
            calls,
            "All gathered.",
        ));
        let orchestrator = orchestrator_with(backend);

        let rx = orchestrator.run_stream(ChatRequest::new("use tools"), CancellationToken::new());
        let events = collect_events(rx).await;

        let starts = events
            .iter()
            .filter(|e| matches!(e, RunEvent::ToolStart { .. }))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, RunEvent::ToolEnd { .. }))
            .count();
        assert_eq!(starts, 2);
        assert_eq!(ends, 2);

        match events.last().unwrap() {
            RunEvent::Done {
                message,
                tool_calls,
                ..
            } => {
                assert_eq!(message, "All gathered.");
                assert_eq!(tool_calls.len(), 2);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_failure_is_one_terminal_error() {
        let backend = Arc::new(SequentialMockBackend::new(vec![Err(BackendError::new(
            401,
            "invalid api key",
        ))]));
        let orchestrator = orchestrator_with(backend);

        let rx = orchestrator.run_stream(ChatRequest::new("hi"), CancellationToken::new());
        let events = collect_events(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RunEvent::Error { .. }));
    }

    /// Streams two deltas with a pause between them, then a final chunk.
    struct PausingBackend;

    #[async_trait]
    impl ModelBackend for PausingBackend {
        fn name(&self) -> &str {
            "pausing"
        }

        async fn generate(&self, _request: ModelRequest) -> Result<ModelOutput, BackendError> {
            unreachable!("streaming only")
        }

        async fn generate_stream(
            &self,
            _request: ModelRequest,
        ) -> Result<mpsc::Receiver<Result<ModelChunk, BackendError>>, BackendError> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(Ok(ModelChunk {
                        text: Some("first".into()),
                        ..Default::default()
                    }))
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
                let _ = tx
                    .send(Ok(ModelChunk {
                        text: Some("second".into()),
                        ..Default::default()
                    }))
                    .await;
                let _ = tx
                    .send(Ok(ModelChunk {
                        done: true,
                        ..Default::default()
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream_without_terminal_event() {
        let orchestrator = orchestrator_with(Arc::new(PausingBackend));
        let cancel = CancellationToken::new();

        let mut rx =
            orchestrator.run_stream(ChatRequest::new("stream this"), cancel.clone());

        // First delta arrives, then we cancel mid-stream.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RunEvent::TextDelta { .. }));
        cancel.cancel();

        // The task stops cooperatively: no further deltas, no terminal
        // event from the run itself (the coordinator owns `cancelled`).
        let remaining = collect_events(rx).await;
        assert!(
            remaining.iter().all(|e| !e.is_terminal()),
            "unexpected terminal event: {remaining:?}"
        );
        assert!(
            !remaining
                .iter()
                .any(|e| matches!(e, RunEvent::TextDelta { .. })),
            "text after cancel: {remaining:?}"
        );
    }
}
