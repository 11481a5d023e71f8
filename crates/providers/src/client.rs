//! Model invocation client: one timed call, typed failures out.
//!
//! Wraps a [`ModelBackend`] with a fixed wall-clock timeout and routes every
//! raw failure through [`classify`](crate::classify::classify). Callers above
//! this layer never see a raw [`BackendError`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use windlass_core::{ModelBackend, ModelChunk, ModelError, ModelOutput, ModelRequest};

use crate::classify::classify;

/// A timed, classifying wrapper around one model backend.
pub struct InvocationClient {
    backend: Arc<dyn ModelBackend>,
    timeout: Duration,
}

impl InvocationClient {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// One complete generation. Timeout and classification applied.
    pub async fn invoke(&self, request: ModelRequest) -> Result<ModelOutput, ModelError> {
        let model = request.model.clone();
        debug!(backend = %self.backend.name(), model = %model, turns = request.turns.len(), "Invoking model");

        match tokio::time::timeout(self.timeout, self.backend.generate(request)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(raw)) => {
                let classified = classify(&raw);
                warn!(model = %model, error = %classified, "Model call failed");
                Err(classified)
            }
            Err(_) => {
                warn!(model = %model, timeout_secs = self.timeout.as_secs(), "Model call timed out");
                Err(ModelError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    /// One streaming generation. The timeout covers stream establishment;
    /// mid-stream failures are classified as they arrive.
    pub async fn invoke_stream(
        &self,
        request: ModelRequest,
    ) -> Result<mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
        let model = request.model.clone();
        debug!(backend = %self.backend.name(), model = %model, "Opening model stream");

        let raw_rx = match tokio::time::timeout(self.timeout, self.backend.generate_stream(request))
            .await
        {
            Ok(Ok(rx)) => rx,
            Ok(Err(raw)) => {
                let classified = classify(&raw);
                warn!(model = %model, error = %classified, "Model stream failed to open");
                return Err(classified);
            }
            Err(_) => {
                warn!(model = %model, timeout_secs = self.timeout.as_secs(), "Model stream open timed out");
                return Err(ModelError::Timeout(self.timeout.as_secs()));
            }
        };

        // Adapt the raw-error receiver into a classified one.
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut raw_rx = raw_rx;
            while let Some(chunk) = raw_rx.recv().await {
                let mapped = chunk.map_err(|raw| classify(&raw));
                if tx.send(mapped).await.is_err() {
                    return; // receiver dropped
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use windlass_core::{BackendError, Turn};

    struct HangingBackend;

    #[async_trait]
    impl ModelBackend for HangingBackend {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn generate(&self, _request: ModelRequest) -> Result<ModelOutput, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    struct RawFailingBackend;

    #[async_trait]
    impl ModelBackend for RawFailingBackend {
        fn name(&self) -> &str {
            "raw_failing"
        }

        async fn generate(&self, _request: ModelRequest) -> Result<ModelOutput, BackendError> {
            Err(BackendError::new(429, "Too Many Requests"))
        }
    }

    fn test_request() -> ModelRequest {
        ModelRequest {
            model: "test-model".into(),
            system_instruction: None,
            turns: vec![Turn::user("hello")],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn timeout_maps_to_typed_error() {
        let client = InvocationClient::new(Arc::new(HangingBackend), Duration::from_millis(50));
        let err = client.invoke(test_request()).await.unwrap_err();
        assert!(matches!(err, ModelError::Timeout(_)));
    }

    #[tokio::test]
    async fn raw_failure_is_classified() {
        let client = InvocationClient::new(Arc::new(RawFailingBackend), Duration::from_secs(5));
        let err = client.invoke(test_request()).await.unwrap_err();
        assert!(matches!(err, ModelError::RateLimited(_)));
    }

    #[tokio::test]
    async fn stream_errors_are_classified() {
        struct StreamFailBackend;

        #[async_trait]
        impl ModelBackend for StreamFailBackend {
            fn name(&self) -> &str {
                "stream_fail"
            }

            async fn generate(&self, _request: ModelRequest) -> Result<ModelOutput, BackendError> {
                unreachable!()
            }

            async fn generate_stream(
                &self,
                _request: ModelRequest,
            ) -> Result<mpsc::Receiver<Result<ModelChunk, BackendError>>, BackendError> {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    let _ = tx
                        .send(Ok(ModelChunk {
                            text: Some("partial".into()),
                            ..Default::default()
                        }))
                        .await;
                    let _ = tx
                        .send(Err(BackendError::transport("connection reset")))
                        .await;
                });
                Ok(rx)
            }
        }

        let client = InvocationClient::new(Arc::new(StreamFailBackend), Duration::from_secs(5));
        let mut rx = client.invoke_stream(test_request()).await.unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.text.as_deref(), Some("partial"));

        let second = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(second, ModelError::Network(_)));
    }
}
