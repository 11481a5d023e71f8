//! Retry & fallback scheduling around the invocation client.
//!
//! Transient failures (rate limit, timeout, overload, generic API/network
//! errors) are retried on the same model with exponential backoff. Context
//! overflow is different: backing off will not shrink the request, so the
//! scheduler rotates to the next fallback model instead, and surfaces
//! `ContextOverflow` once the rotation is exhausted: the iteration loop
//! then compacts the transcript and re-invokes. Authentication, billing,
//! and missing-key failures propagate immediately.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use windlass_config::AgentSettings;
use windlass_core::{ModelBackend, ModelChunk, ModelError, ModelOutput, ModelRequest};

use crate::client::InvocationClient;
use crate::retry::RetryPolicy;

/// A successful scheduled generation, tagged with the model that answered.
#[derive(Debug)]
pub struct ScheduledOutput {
    pub output: ModelOutput,
    /// Which model actually answered (primary or a fallback).
    pub model_used: String,
}

/// A successfully established scheduled stream.
pub struct ScheduledStream {
    pub chunks: mpsc::Receiver<Result<ModelChunk, ModelError>>,
    pub model_used: String,
}

/// Schedules model calls across `[primary, ...fallbacks]` with retry.
pub struct ModelScheduler {
    client: InvocationClient,
    primary: String,
    fallbacks: Vec<String>,
    policy: RetryPolicy,
}

impl ModelScheduler {
    pub fn new(
        client: InvocationClient,
        primary: impl Into<String>,
        fallbacks: Vec<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            primary: primary.into(),
            fallbacks,
            policy,
        }
    }

    /// Build a scheduler from resolved settings.
    pub fn from_settings(backend: Arc<dyn ModelBackend>, settings: &AgentSettings) -> Self {
        Self::new(
            InvocationClient::new(backend, settings.model.request_timeout()),
            settings.model.primary.clone(),
            settings.model.fallbacks.clone(),
            RetryPolicy::from_config(&settings.retry),
        )
    }

    fn rotation(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }

    /// One scheduled generation.
    pub async fn invoke(&self, request: &ModelRequest) -> Result<ScheduledOutput, ModelError> {
        let mut last_overflow: Option<ModelError> = None;

        for model in self.rotation() {
            let mut attempt = 0u32;
            loop {
                let mut model_request = request.clone();
                model_request.model = model.to_string();

                match self.client.invoke(model_request).await {
                    Ok(output) => {
                        return Ok(ScheduledOutput {
                            output,
                            model_used: model.to_string(),
                        });
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(ModelError::ContextOverflow(message)) => {
                        info!(model = %model, "Context overflow, rotating to next model");
                        last_overflow = Some(ModelError::ContextOverflow(message));
                        break;
                    }
                    Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                        attempt += 1;
                        let delay = self.policy.backoff_for(attempt);
                        warn!(
                            model = %model,
                            attempt,
                            max_retries = self.policy.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying after transient failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Only reachable when every model in the rotation overflowed.
        Err(last_overflow
            .unwrap_or_else(|| ModelError::ContextOverflow("all models exhausted".into())))
    }

    /// Establish one scheduled stream. Rotation and retry apply at
    /// establishment; once chunks are flowing, failures surface in-band.
    pub async fn invoke_stream(&self, request: &ModelRequest) -> Result<ScheduledStream, ModelError> {
        let mut last_overflow: Option<ModelError> = None;

        for model in self.rotation() {
            let mut attempt = 0u32;
            loop {
                let mut model_request = request.clone();
                model_request.model = model.to_string();

                match self.client.invoke_stream(model_request).await {
                    Ok(chunks) => {
                        return Ok(ScheduledStream {
                            chunks,
                            model_used: model.to_string(),
                        });
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(ModelError::ContextOverflow(message)) => {
                        info!(model = %model, "Context overflow on stream open, rotating");
                        last_overflow = Some(ModelError::ContextOverflow(message));
                        break;
                    }
                    Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                        attempt += 1;
                        let delay = self.policy.backoff_for(attempt);
                        warn!(
                            model = %model,
                            attempt,
                            error = %err,
                            "Retrying stream open after transient failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(last_overflow
            .unwrap_or_else(|| ModelError::ContextOverflow("all models exhausted".into())))
    }
}

/// Convenience constructor used in tests and by embedders that want the
/// default 60s call timeout without going through full settings.
pub fn scheduler_with_defaults(
    backend: Arc<dyn ModelBackend>,
    primary: impl Into<String>,
    fallbacks: Vec<String>,
) -> ModelScheduler {
    ModelScheduler::new(
        InvocationClient::new(backend, Duration::from_secs(60)),
        primary,
        fallbacks,
        RetryPolicy::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use windlass_core::{BackendError, Turn};

    /// Scripted backend: each entry is the raw result for one call, in order.
    /// Repeats the last entry when the script runs out.
    struct ScriptedBackend {
        script: Vec<Result<ModelOutput, BackendError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<ModelOutput, BackendError>>) -> Self {
            Self {
                script,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn models_called(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: ModelRequest) -> Result<ModelOutput, BackendError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.model.clone());
            let index = (calls.len() - 1).min(self.script.len() - 1);
            self.script[index].clone()
        }
    }

    fn text_output(text: &str) -> Result<ModelOutput, BackendError> {
        Ok(ModelOutput {
            text: text.into(),
            tool_calls: vec![],
            usage: None,
        })
    }

    fn overflow() -> Result<ModelOutput, BackendError> {
        Err(BackendError::new(400, "prompt is too long: 9999 > 8192 maximum"))
    }

    fn server_error() -> Result<ModelOutput, BackendError> {
        Err(BackendError::new(500, "internal error"))
    }

    fn test_request() -> ModelRequest {
        ModelRequest {
            model: String::new(),
            system_instruction: None,
            turns: vec![Turn::user("hello")],
            tools: vec![],
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn scheduler(backend: Arc<ScriptedBackend>, fallbacks: Vec<String>, max_retries: u32) -> ModelScheduler {
        ModelScheduler::new(
            InvocationClient::new(backend, Duration::from_secs(5)),
            "primary-model",
            fallbacks,
            fast_policy(max_retries),
        )
    }

    #[tokio::test]
    async fn primary_succeeds_first_try() {
        let backend = Arc::new(ScriptedBackend::new(vec![text_output("ok")]));
        let sched = scheduler(backend.clone(), vec!["fallback-model".into()], 3);

        let result = sched.invoke(&test_request()).await.unwrap();
        assert_eq!(result.model_used, "primary-model");
        assert_eq!(result.output.text, "ok");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        // Two 500s then success: 3 calls total
        let backend = Arc::new(ScriptedBackend::new(vec![
            server_error(),
            server_error(),
            text_output("recovered"),
        ]));
        let sched = scheduler(backend.clone(), vec![], 3);

        let result = sched.invoke(&test_request()).await.unwrap();
        assert_eq!(result.output.text, "recovered");
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn retries_exhaust_after_max_plus_one_calls() {
        let backend = Arc::new(ScriptedBackend::new(vec![server_error()]));
        let sched = scheduler(backend.clone(), vec![], 2);

        let err = sched.invoke(&test_request()).await.unwrap_err();
        assert!(matches!(err, ModelError::Api { status: 500, .. }));
        // initial call + 2 retries
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn timeout_counts_as_retryable() {
        struct SlowFirstBackend {
            calls: Mutex<usize>,
        }

        #[async_trait]
        impl ModelBackend for SlowFirstBackend {
            fn name(&self) -> &str {
                "slow_first"
            }

            async fn generate(&self, _request: ModelRequest) -> Result<ModelOutput, BackendError> {
                let call = {
                    let mut calls = self.calls.lock().unwrap();
                    *calls += 1;
                    *calls
                };
                if call == 1 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(ModelOutput {
                    text: "late but fine".into(),
                    tool_calls: vec![],
                    usage: None,
                })
            }
        }

        let backend = Arc::new(SlowFirstBackend {
            calls: Mutex::new(0),
        });
        let sched = ModelScheduler::new(
            InvocationClient::new(backend, Duration::from_millis(50)),
            "primary-model",
            vec![],
            fast_policy(2),
        );

        let result = sched.invoke(&test_request()).await.unwrap();
        assert_eq!(result.output.text, "late but fine");
    }

    #[tokio::test]
    async fn overflow_rotates_before_compaction() {
        // Primary overflows once; fallback answers. No retry on the primary.
        let backend = Arc::new(ScriptedBackend::new(vec![
            overflow(),
            text_output("from fallback"),
        ]));
        let sched = scheduler(backend.clone(), vec!["fallback-model".into()], 3);

        let result = sched.invoke(&test_request()).await.unwrap();
        assert_eq!(result.model_used, "fallback-model");
        assert_eq!(
            backend.models_called(),
            vec!["primary-model", "fallback-model"]
        );
    }

    #[tokio::test]
    async fn overflow_everywhere_surfaces_overflow() {
        let backend = Arc::new(ScriptedBackend::new(vec![overflow()]));
        let sched = scheduler(backend.clone(), vec!["fallback-model".into()], 3);

        let err = sched.invoke(&test_request()).await.unwrap_err();
        assert!(matches!(err, ModelError::ContextOverflow(_)));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn fatal_failure_short_circuits() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(BackendError::new(
            401,
            "invalid api key",
        ))]));
        let sched = scheduler(backend.clone(), vec!["fallback-model".into()], 3);

        let err = sched.invoke(&test_request()).await.unwrap_err();
        assert!(matches!(err, ModelError::Authentication(_)));
        // No retry, no fallback
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn stream_establishment_rotates_on_overflow() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            overflow(),
            text_output("streamed answer"),
        ]));
        let sched = scheduler(backend.clone(), vec!["fallback-model".into()], 3);

        let mut stream = sched.invoke_stream(&test_request()).await.unwrap();
        assert_eq!(stream.model_used, "fallback-model");

        let chunk = stream.chunks.recv().await.unwrap().unwrap();
        assert!(chunk.done);
        assert_eq!(chunk.text.as_deref(), Some("streamed answer"));
    }
}
