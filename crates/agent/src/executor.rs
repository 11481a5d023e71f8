//! Concurrent tool execution with per-call timeouts and a pending-result
//! guard.
//!
//! All calls from one model turn run concurrently; there is no ordering
//! dependency between siblings. Results come back in *request* order
//! regardless of completion order. A failing or timed-out call produces a
//! `ToolResult` carrying `error`: it never aborts its siblings and never
//! fails the run.
//!
//! The [`ToolResultGuard`] tracks every call id handed to the executor. If
//! the surrounding run is interrupted, `flush()` synthesizes an error result
//! for each id still pending so the transcript can be closed off validly.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use windlass_core::{ToolCallRequest, ToolError, ToolRegistry, ToolResult};

/// Tracks outstanding tool call ids for one run.
#[derive(Default)]
pub struct ToolResultGuard {
    pending: Mutex<HashSet<String>>,
}

impl ToolResultGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record ids as pending before execution starts.
    pub fn register<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.extend(ids.into_iter().map(Into::into));
    }

    /// Mark one id resolved. Returns whether it was pending.
    pub fn resolve(&self, id: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(id)
    }

    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }

    /// Synthesize an error result for every still-pending id and clear the
    /// set. Called when a run is interrupted so the transcript stays
    /// well-formed.
    pub fn flush(&self) -> Vec<ToolResult> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = pending.drain().collect();
        ids.sort();
        if !ids.is_empty() {
            warn!(count = ids.len(), "Flushing unresolved tool calls");
        }
        ids.into_iter()
            .map(|id| ToolResult::error(id, "tool execution was interrupted"))
            .collect()
    }
}

/// Executes the tool calls of one iteration.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Run all calls concurrently. Every requested call yields exactly one
    /// result, in request order; ids are registered with and resolved
    /// against the guard.
    pub async fn execute_all(
        &self,
        calls: &[ToolCallRequest],
        guard: &ToolResultGuard,
    ) -> Vec<ToolResult> {
        guard.register(calls.iter().map(|c| c.id.clone()));

        let results =
            futures::future::join_all(calls.iter().map(|call| self.execute_one(call))).await;

        for result in &results {
            guard.resolve(&result.call_id);
        }
        results
    }

    /// Run a single call with its own timeout. Failures become error
    /// results, never panics or run-level errors.
    pub async fn execute_one(&self, call: &ToolCallRequest) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "Requested tool is not registered");
            return ToolResult::error(&call.id, ToolError::NotFound(call.name.clone()).to_string());
        };

        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        let started = std::time::Instant::now();

        let result =
            match tokio::time::timeout(self.timeout, tool.execute(&call.id, call.arguments.clone()))
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    ToolResult::error(&call.id, e.to_string())
                }
                Err(_) => {
                    warn!(tool = %call.name, timeout_secs = self.timeout.as_secs(), "Tool timed out");
                    ToolResult::error(
                        &call.id,
                        ToolError::Timeout {
                            tool_name: call.name.clone(),
                            timeout_secs: self.timeout.as_secs(),
                        }
                        .to_string(),
                    )
                }
            };

        debug!(
            tool = %call.name,
            call_id = %call.id,
            duration_ms = started.elapsed().as_millis() as u64,
            success = !result.is_error(),
            "Tool call resolved"
        );
        result
    }
}
