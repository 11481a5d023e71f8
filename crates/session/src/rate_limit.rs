//! Admission rate limiting, keyed by caller identity.
//!
//! A sliding per-identity counter: exceeding `max_requests` within the
//! window blocks the identity for `block_duration`. While blocked, checks
//! short-circuit; once the block passes, the identity's state resets. A
//! periodic sweeper removes entries untouched for more than twice the
//! window along with expired blocks.
//!
//! No globals: construct a limiter, inject it where admission happens, and
//! start/stop the sweeper explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use windlass_config::RateLimitConfig;

/// The outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until the caller may try again; 0 when allowed.
    pub retry_after_secs: u64,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
        }
    }

    fn blocked_for(remaining: Duration) -> Self {
        Self {
            allowed: false,
            retry_after_secs: remaining.as_secs_f64().ceil() as u64,
        }
    }
}

/// Per-identity window state.
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked_until: None,
            last_seen: now,
        }
    }
}

/// Sliding-window rate limiter with block durations.
///
/// Thread-safe via a brief `std::sync::Mutex`; the lock is never held
/// across an await.
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request from `identity` and decide whether to admit it.
    pub fn check(&self, identity: &str) -> RateDecision {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(identity.to_string())
            .or_insert_with(|| RateLimitEntry::new(now));
        entry.last_seen = now;

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return RateDecision::blocked_for(blocked_until - now);
            }
            // Block expired: the identity starts fresh.
            *entry = RateLimitEntry::new(now);
        }

        if now.duration_since(entry.window_start) >= self.config.window() {
            entry.window_start = now;
            entry.count = 0;
        }

        entry.count += 1;
        if entry.count > self.config.max_requests {
            let blocked_until = now + self.config.block_duration();
            entry.blocked_until = Some(blocked_until);
            warn!(
                identity = %identity,
                count = entry.count,
                block_secs = self.config.block_duration().as_secs(),
                "Rate limit exceeded, blocking identity"
            );
            return RateDecision::blocked_for(self.config.block_duration());
        }

        RateDecision::allowed()
    }

    /// Drop entries untouched for more than twice the window, and entries
    /// whose block has expired.
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale_after = self.config.window() * 2;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| {
            let stale = now.duration_since(entry.last_seen) > stale_after;
            let block_expired = entry.blocked_until.is_some_and(|until| now >= until);
            !stale && !block_expired
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept rate limit entries");
        }
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    /// Start the periodic sweeper. The returned handle stops it; dropping
    /// the handle stops it too.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let limiter = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        });
        SweeperHandle { task }
    }
}

/// Lifecycle handle for the background sweeper task.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
