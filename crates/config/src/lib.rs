//! Configuration types for the Windlass orchestration core.
//!
//! These structs arrive *already resolved* from the embedding application;
//! this crate never reads the environment or disk. Everything derives
//! `Deserialize` with field-level defaults so partial configuration maps
//! cleanly onto sensible values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The root settings structure for one agent.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// API key for the model backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model selection and call timeout
    #[serde(default)]
    pub model: ModelConfig,

    /// Retry and backoff policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Iteration loop bounds
    #[serde(default)]
    pub run: LoopConfig,

    /// Admission limits, one per request path
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: ModelConfig::default(),
            retry: RetryConfig::default(),
            run: LoopConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AgentSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSettings")
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("retry", &self.retry)
            .field("run", &self.run)
            .field("admission", &self.admission)
            .finish()
    }
}

/// Which models to call, in what order, and how long to wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Primary model name
    #[serde(default = "default_primary_model")]
    pub primary: String,

    /// Fallback models, tried in order on context overflow
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Wall-clock timeout for one model call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ModelConfig {
    /// The full rotation: primary first, then fallbacks.
    pub fn rotation(&self) -> Vec<String> {
        let mut models = Vec::with_capacity(1 + self.fallbacks.len());
        models.push(self.primary.clone());
        models.extend(self.fallbacks.iter().cloned());
        models
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_model(),
            fallbacks: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_primary_model() -> String {
    "gemini-2.0-flash".into()
}
fn default_request_timeout_secs() -> u64 {
    60
}

/// Exponential backoff policy for transient model failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Multiplier applied per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

/// Bounds on one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Hard cap on model+tool iterations
    #[serde(default = "default_hard_iteration_cap")]
    pub hard_iteration_cap: u32,

    /// Past this iteration, the system instruction carries a budget notice
    #[serde(default = "default_soft_iteration_threshold")]
    pub soft_iteration_threshold: u32,

    /// Trim-and-retry cycles allowed per run when the context overflows
    #[serde(default = "default_max_compaction_attempts")]
    pub max_compaction_attempts: u32,

    /// Per-call timeout for tool execution
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl LoopConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            hard_iteration_cap: default_hard_iteration_cap(),
            soft_iteration_threshold: default_soft_iteration_threshold(),
            max_compaction_attempts: default_max_compaction_attempts(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_hard_iteration_cap() -> u32 {
    10
}
fn default_soft_iteration_threshold() -> u32 {
    6
}
fn default_max_compaction_attempts() -> u32 {
    3
}
fn default_tool_timeout_secs() -> u64 {
    30
}

/// Rate limiting for one admission path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// How long an identity stays blocked after exceeding the limit
    pub block_duration_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }

    /// Defaults for the plain (batch) admission path.
    pub fn plain() -> Self {
        Self {
            max_requests: 30,
            window_ms: 60_000,
            block_duration_ms: 60_000,
        }
    }

    /// Defaults for the streaming admission path. Stricter: streams hold
    /// resources far longer than batch requests.
    pub fn streaming() -> Self {
        Self {
            max_requests: 10,
            window_ms: 60_000,
            block_duration_ms: 120_000,
        }
    }
}

/// Admission limits per request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "RateLimitConfig::plain")]
    pub plain: RateLimitConfig,

    #[serde(default = "RateLimitConfig::streaming")]
    pub streaming: RateLimitConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            plain: RateLimitConfig::plain(),
            streaming: RateLimitConfig::streaming(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = AgentSettings::default();
        assert!(settings.run.soft_iteration_threshold < settings.run.hard_iteration_cap);
        assert!(settings.retry.max_retries > 0);
        assert!(settings.model.fallbacks.is_empty());
    }

    #[test]
    fn rotation_puts_primary_first() {
        let model = ModelConfig {
            primary: "main-model".into(),
            fallbacks: vec!["fallback-a".into(), "fallback-b".into()],
            request_timeout_secs: 60,
        };
        assert_eq!(model.rotation(), vec!["main-model", "fallback-a", "fallback-b"]);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: AgentSettings = serde_json::from_str(
            r#"{ "model": { "primary": "gpt-4o", "fallbacks": ["gpt-4o-mini"] } }"#,
        )
        .unwrap();
        assert_eq!(settings.model.primary, "gpt-4o");
        assert_eq!(settings.model.fallbacks, vec!["gpt-4o-mini"]);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.run.hard_iteration_cap, 10);
    }

    #[test]
    fn streaming_admission_is_stricter() {
        let admission = AdmissionConfig::default();
        assert!(admission.streaming.max_requests < admission.plain.max_requests);
        assert!(admission.streaming.block_duration() >= admission.plain.block_duration());
    }

    #[test]
    fn debug_redacts_api_key() {
        let settings = AgentSettings {
            api_key: Some("sk-secret-value".into()),
            ..Default::default()
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("sk-secret-value"));
        assert!(debug.contains("[REDACTED]"));
    }
}
