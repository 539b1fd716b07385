//! Retry classification and exponential backoff with jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// HTTP statuses worth another attempt. Zero stands for "no response".
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [0, 429, 500, 502, 503, 504];

/// Whether a failed attempt with `status_code` may be retried.
pub fn is_retryable_status(status_code: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status_code)
}

/// Backoff and budget settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor per failed attempt.
    pub backoff_factor: f64,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the delay, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again at `next_attempt_at`.
    Retry {
        /// Earliest time for the next attempt
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop; the attempt budget is used up.
    Exhausted {
        /// Attempts made, equal to the budget
        attempts: u32,
    },
    /// Stop; the failure is not transient.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Unjittered delay after `attempts_made` failed attempts.
    ///
    /// `initial_delay * backoff_factor^(attempts_made - 1)`, capped at
    /// `max_delay`. Zero attempts is treated as one.
    pub fn base_delay(&self, attempts_made: u32) -> Duration {
        let exponent = i32::try_from(attempts_made.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Jittered delay after `attempts_made` failed attempts, never above
    /// `max_delay`.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        apply_jitter(self.base_delay(attempts_made), self.jitter_factor).min(self.max_delay)
    }

    /// Decides whether a delivery that has made `attempts_made` attempts,
    /// the last ending with `status_code` at `failed_at`, gets another.
    pub fn decide(&self, attempts_made: u32, status_code: u16, failed_at: DateTime<Utc>) -> RetryDecision {
        if !is_retryable_status(status_code) {
            return RetryDecision::GiveUp { reason: format!("non-retryable status {status_code}") };
        }
        if attempts_made >= self.max_attempts {
            return RetryDecision::Exhausted { attempts: attempts_made };
        }

        let Ok(delay) = chrono::Duration::from_std(self.delay_for(attempts_made)) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };
        RetryDecision::Retry { next_attempt_at: failed_at + delay }
    }
}

/// Randomizes `duration` by up to `±jitter_factor` of its length.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    let factor = jitter_factor.clamp(0.0, 1.0);
    let secs = duration.as_secs_f64();
    let range = secs * factor;
    if range <= 0.0 {
        return duration;
    }
    let offset = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((secs + offset).max(0.0))
}
