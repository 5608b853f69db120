//! Retry policy: backoff computation and error classification.
//!
//! Everything here is pure. The only source of nondeterminism is the jitter
//! draw in [`RetryPolicy::delay`], and [`RetryPolicy::delay_with_jitter`]
//! exposes the same computation with the random unit passed in.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles per retry.
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Retry budget stamped onto new jobs.
    pub max_retries: u32,
    /// Jitter span as a fraction of `base_delay` (clamped to 0.0..=1.0).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_retries: 3,
            jitter_ratio: 0.2,
        }
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back as `failed` with a new retry count and due time.
    Reschedule {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Quarantine the job; `reason` combines attempt count and last error.
    DeadLetter { attempts: u32, reason: String },
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Deterministic part of the delay: `min(max_delay, base_delay * 2^retry_count)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let factor = 1u128.checked_shl(retry_count).unwrap_or(u128::MAX);
        let delay_ms = base_ms.saturating_mul(factor).min(max_ms);
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    /// Largest jitter that can be added (exclusive).
    pub fn jitter_span(&self) -> Duration {
        self.base_delay.mul_f64(self.jitter_ratio.clamp(0.0, 1.0))
    }

    /// Backoff plus `unit * jitter_span`, with `unit` in `[0, 1)`.
    pub fn delay_with_jitter(&self, retry_count: u32, unit: f64) -> Duration {
        let backoff = self.backoff(retry_count);
        let span = self.jitter_span().as_nanos();
        if span == 0 {
            return backoff;
        }

        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.0 };
        // Strictly below the span, even for unit == 1.0.
        let jitter = (((span as f64) * unit) as u128).min(span - 1);
        backoff + Duration::from_nanos(u64::try_from(jitter).unwrap_or(u64::MAX))
    }

    /// Backoff with a fresh uniform jitter draw.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_jitter(retry_count, unit)
    }

    /// When a job that has been retried `retry_count` times becomes due again.
    pub fn next_retry_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.delay(retry_count))
    }

    /// Decide between reschedule and dead-letter for a failed attempt.
    ///
    /// A job dead-letters when the error is not retryable or when this failure
    /// would exhaust its budget (`retry_count + 1 >= max_retries`).
    pub fn decide(
        &self,
        retry_count: u32,
        max_retries: u32,
        retryable: bool,
        error: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let attempts = retry_count.saturating_add(1);
        if !retryable || attempts >= max_retries {
            let reason = if retryable {
                format!("failed after {attempts} attempt(s): {error}")
            } else {
                format!("non-retryable failure after {attempts} attempt(s): {error}")
            };
            return RetryDecision::DeadLetter { attempts, reason };
        }

        RetryDecision::Reschedule {
            retry_count: attempts,
            next_retry_at: self.next_retry_at(retry_count, now),
        }
    }
}

/// Convert a std duration into a chrono one.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}

/// Phrases that mark an error as permanent. Retrying will not change the outcome.
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "unauthorized",
    "unauthorised",
    "authorization",
    "forbidden",
    "permission denied",
    "not found",
];

/// Classify an opaque error message.
///
/// Validation, authorization, not-found and malformed-input errors are
/// permanent; everything else (timeouts, transient I/O, crashes) is retryable.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    !NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Failure of a single job attempt, by origin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    /// Rasterizer crashed or returned an error.
    #[error("render failed: {0}")]
    TransientRender(String),
    #[error("render timed out after {0:?}")]
    RenderTimeout(Duration),
    /// Upload to object storage failed.
    #[error("upload failed: {0}")]
    Storage(String),
    #[error("upload timed out after {0:?}")]
    StorageTimeout(Duration),
    /// Payload rejected before or during rendering.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl JobFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            JobFailure::Validation(_) | JobFailure::Authorization(_) | JobFailure::NotFound(_) => {
                false
            }
            JobFailure::RenderTimeout(_) | JobFailure::StorageTimeout(_) => true,
            JobFailure::TransientRender(msg) | JobFailure::Storage(msg) => {
                is_retryable_message(msg)
            }
        }
    }
}
