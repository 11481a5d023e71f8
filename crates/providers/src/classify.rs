//! Raw backend failure → typed error kind classification.
//!
//! Providers disagree on how they phrase the same failure: context overflow
//! arrives as HTTP 400 with "maximum context length" from OpenAI-compatible
//! endpoints, as "prompt is too long" from Anthropic, and as
//! "input token count exceeds" from Gemini. This module centralizes the
//! signature matching in one pure function with no side effects, so the
//! mapping can be tested without a live call.

use windlass_core::{BackendError, ModelError};

/// Classify a raw backend failure into a typed [`ModelError`].
///
/// Message phrasing is checked before status codes: several providers report
/// overflow and billing problems under generic 400-class statuses, so the
/// payload text is the more reliable signal.
pub fn classify(raw: &BackendError) -> ModelError {
    let message = raw.message.to_ascii_lowercase();

    if is_context_overflow(&message) {
        return ModelError::ContextOverflow(raw.message.clone());
    }
    if is_billing(&message) || raw.status == Some(402) {
        return ModelError::Billing(raw.message.clone());
    }
    if is_rate_limit(&message) || raw.status == Some(429) {
        return ModelError::RateLimited(raw.message.clone());
    }
    if is_overloaded(&message) || matches!(raw.status, Some(503) | Some(529)) {
        return ModelError::Overloaded(raw.message.clone());
    }
    if is_authentication(&message) || matches!(raw.status, Some(401) | Some(403)) {
        return ModelError::Authentication(raw.message.clone());
    }

    match raw.status {
        Some(status) => ModelError::Api {
            status,
            message: raw.message.clone(),
        },
        None => ModelError::Network(raw.message.clone()),
    }
}

fn is_context_overflow(message: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "context length",
        "context window",
        "maximum context",
        "prompt is too long",
        "too many tokens",
        "input token count",
        "exceeds the maximum number of tokens",
        "request too large",
    ];
    SIGNATURES.iter().any(|sig| message.contains(sig))
}

fn is_rate_limit(message: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "rate limit",
        "rate-limit",
        "too many requests",
        "resource_exhausted",
        "resource exhausted",
        "requests per minute",
    ];
    SIGNATURES.iter().any(|sig| message.contains(sig))
}

fn is_overloaded(message: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "overloaded",
        "over capacity",
        "service unavailable",
        "temporarily unavailable",
    ];
    SIGNATURES.iter().any(|sig| message.contains(sig))
}

fn is_authentication(message: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "invalid api key",
        "invalid x-api-key",
        "incorrect api key",
        "api key not valid",
        "authentication",
        "unauthorized",
        "permission denied",
    ];
    SIGNATURES.iter().any(|sig| message.contains(sig))
}

fn is_billing(message: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "billing",
        "insufficient credit",
        "insufficient_quota",
        "exceeded your current quota",
        "payment required",
        "purchase credits",
    ];
    SIGNATURES.iter().any(|sig| message.contains(sig))
}
