//! Bounded retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::{Error, Result};
use tracing::{debug, warn};

use crate::RequestContext;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(attempt-1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// Re-runs a read-modify-write sequence while it fails with `Conflict`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self { Self { max_attempts: 5, backoff: Backoff::Fixed { delay_ms: 10 } } }
}

impl ConflictRetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self { Self { max_attempts, backoff } }

    /// Run `op` (given the 1-based attempt number) until it succeeds, fails
    /// with anything but `Conflict`, or the attempt budget is spent.
    /// Cancellation is honoured between attempts.
    pub async fn run<T, F, Fut>(&self, ctx: &RequestContext, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match op(attempt).await {
                Err(e) if e.is_conflict() && attempt < attempts => {
                    debug!(key = %key, attempt, error = %e, "conflict; retrying");
                    metrics::counter!("registry_conflict_retries", 1u64);
                    let delay = self.backoff.delay(attempt);
                    if !delay.is_zero() {
                        ctx.sleep(delay).await?;
                    }
                    attempt += 1;
                }
                Err(e) if e.is_conflict() => {
                    warn!(key = %key, attempts, "conflict retries exhausted");
                    metrics::counter!("registry_conflict_exhausted_total", 1u64);
                    return Err(Error::conflict(key, format!("gave up after {} attempts: {}", attempts, e)));
                }
                other => return other,
            }
        }
    }
}
