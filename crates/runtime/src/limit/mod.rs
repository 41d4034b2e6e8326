//! Cooperative cancellation flags and embedding rate limiting
//!
//! Cancel flags are short-lived records keyed by job id; running jobs poll
//! them at checkpoints. The rate limiter is fail-fast by contract: a request
//! that would exceed the window ceiling errors immediately instead of
//! blocking, so a saturated worker pool cannot starve other jobs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::RateLimitConfig;
use crate::types::{CancelKind, JobId};

/// Default lifetime of a cancel flag
pub const CANCEL_FLAG_TTL: Duration = Duration::from_secs(3600);

/// A pending cancellation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelFlag {
    pub job_id: JobId,
    pub kind: CancelKind,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Single-writer, many-reader registry of cancel flags
pub struct CancelRegistry {
    flags: DashMap<JobId, (CancelFlag, Instant)>,
    ttl: Duration,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::with_ttl(CANCEL_FLAG_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            flags: DashMap::new(),
            ttl,
        }
    }

    /// Record a cancellation request. The owning job observes it at its next
    /// checkpoint.
    pub fn request_cancel(&self, job_id: JobId, kind: CancelKind, reason: impl Into<String>) {
        let flag = CancelFlag {
            job_id,
            kind,
            reason: reason.into(),
            requested_at: Utc::now(),
        };
        tracing::info!("Cancel requested for job {}: {}", job_id, flag.reason);
        self.flags.insert(job_id, (flag, Instant::now()));
    }

    /// Look up a live cancel flag, purging it if expired.
    pub fn check(&self, job_id: JobId) -> Option<CancelFlag> {
        if let Some(entry) = self.flags.get(&job_id) {
            let (flag, set_at) = entry.value();
            if set_at.elapsed() < self.ttl {
                return Some(flag.clone());
            }
        }
        self.flags.remove_if(&job_id, |_, (_, set_at)| set_at.elapsed() >= self.ttl);
        None
    }

    /// Drop the flag once the job has fully stopped.
    pub fn clear(&self, job_id: JobId) {
        self.flags.remove(&job_id);
    }

    /// Remove all expired flags.
    pub fn purge_expired(&self) {
        self.flags.retain(|_, (_, set_at)| set_at.elapsed() < self.ttl);
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limiter usage snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitUsage {
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    pub window_seconds: u64,
}

struct WindowState {
    consumed: u64,
    window_start: Instant,
}

/// Fixed-window token limiter for the embedding API
pub struct EmbeddingRateLimiter {
    config: RateLimitConfig,
    window: Mutex<WindowState>,
}

impl EmbeddingRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: Mutex::new(WindowState {
                consumed: 0,
                window_start: Instant::now(),
            }),
            config,
        }
    }

    fn roll_window(&self, state: &mut WindowState) {
        if state.window_start.elapsed() >= self.config.window {
            state.consumed = 0;
            state.window_start = Instant::now();
        }
    }

    /// Fail-fast admission check: true when `tokens` fit under the ceiling.
    /// Does not consume.
    pub fn check(&self, tokens: u64) -> bool {
        let mut state = self.window.lock();
        self.roll_window(&mut state);
        let fits = state.consumed + tokens <= self.config.max_tokens_per_window;
        if !fits {
            tracing::warn!(
                "Embedding rate limit exceeded: {} + {} > {}",
                state.consumed,
                tokens,
                self.config.max_tokens_per_window
            );
        }
        fits
    }

    /// Record tokens actually consumed by a completed batch.
    pub fn record(&self, tokens: u64) {
        let mut state = self.window.lock();
        self.roll_window(&mut state);
        state.consumed += tokens;
    }

    pub fn usage(&self) -> RateLimitUsage {
        let mut state = self.window.lock();
        self.roll_window(&mut state);
        RateLimitUsage {
            current_usage: state.consumed,
            limit: self.config.max_tokens_per_window,
            remaining: self.config.max_tokens_per_window.saturating_sub(state.consumed),
            window_seconds: self.config.window.as_secs(),
        }
    }
}

/// Process-wide bound on concurrent outbound embedding calls, shared across
/// all jobs in the worker.
pub struct EmbeddingPool {
    semaphore: Arc<Semaphore>,
}

impl EmbeddingPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        // The semaphore is never closed while the runtime lives.
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("embedding pool semaphore closed"))
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
