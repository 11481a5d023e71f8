//! Model invocation for Windlass: the timed client, failure classification,
//! retry & fallback scheduling, and one OpenAI-compatible HTTP backend.
//!
//! Layering, bottom up:
//!
//! 1. A [`ModelBackend`](windlass_core::ModelBackend) performs the raw call
//!    and reports failures verbatim.
//! 2. [`InvocationClient`] adds the wall-clock timeout and classifies raw
//!    failures into typed kinds via [`classify`].
//! 3. [`ModelScheduler`] adds backoff retry for transient kinds and rotates
//!    through fallback models on context overflow.

pub mod classify;
pub mod client;
pub mod http;
pub mod retry;
pub mod scheduler;

pub use classify::classify;
pub use client::InvocationClient;
pub use http::HttpBackend;
pub use retry::RetryPolicy;
pub use scheduler::{ModelScheduler, ScheduledOutput, ScheduledStream, scheduler_with_defaults};
