//! Retry policy for transient local-store contention
//!
//! SQLite reports `SQLITE_BUSY`/`SQLITE_LOCKED` when another connection holds
//! the write lock. Those errors are retried with capped exponential backoff
//! plus jitter; every other error is returned to the caller untouched.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, SyncError};
use crate::types::RetryConfig;

/// Message fragments that mark a store error as contention
const CONTENTION_KEYWORDS: &[&str] = &["busy", "locked", "lock timeout", "deadlock"];

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
}

/// Per-invocation retry bookkeeping
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay slept before the current attempt
    pub last_delay: Duration,
    pub last_classification: Option<Classification>,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            last_delay: Duration::ZERO,
            last_classification: None,
        }
    }

    pub fn attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Classifies errors and computes backoff delays
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide whether an error is worth another attempt
    pub fn classify(&self, err: &SyncError) -> Classification {
        let retryable = match err {
            SyncError::NotFound { .. } => false,
            e if e.is_retryable() => true,
            SyncError::Database(e) => has_contention_keyword(&e.to_string()),
            _ => false,
        };
        Classification { retryable }
    }

    /// `min(base * 2^(attempt-1) + random(0, jitter), cap)` for a 1-based attempt
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let exponential = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exponent);
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        let delay_ms = exponential
            .saturating_add(jitter)
            .min(self.config.cap_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Backoff for the context's current attempt, never shorter than the previous one
    pub fn next_delay(&self, ctx: &mut RetryContext) -> Duration {
        let delay = self.backoff_delay(ctx.attempt).max(ctx.last_delay);
        ctx.last_delay = delay;
        delay
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// The last error is returned as-is so callers can still match on it.
    pub async fn retry<T, F, Fut>(&self, max_attempts: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = RetryContext::new(max_attempts);

        loop {
            ctx.attempt += 1;

            let err = match operation().await {
                Ok(value) => {
                    if ctx.attempt > 1 {
                        tracing::debug!(attempt = ctx.attempt, "Store operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let classification = self.classify(&err);
            ctx.last_classification = Some(classification);

            if !classification.retryable {
                return Err(err);
            }
            if !ctx.attempts_left() {
                tracing::error!(
                    attempts = ctx.attempt,
                    error = %err,
                    "Store operation still contended after all retries"
                );
                return Err(err);
            }

            let delay = self.next_delay(&mut ctx);
            tracing::warn!(
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient store error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn has_contention_keyword(message: &str) -> bool {
    let message = message.to_lowercase();
    CONTENTION_KEYWORDS.iter().any(|k| message.contains(k))
}
