//! Retry Bookkeeping with Exponential Backoff
//!
//! Two related pieces live here:
//!
//! - [`ExponentialBackoff`]: the delay calculation shared by every retry loop
//!   in the workspace (slice pipeline open-loop, connection dial-loop and the
//!   metadata retry schedule).
//! - [`Retryable`] + [`RetryBackoff`]: persisted retry state of a File or
//!   Slice. A failed operation increments the attempt counter and computes
//!   the time after which the operation may be retried.
//!
//! ## Backoff Calculation
//!
//! ```text
//! delay(attempt) = min(initial * multiplier^(attempt-1), max) * jitter
//! jitter         = random in [1 - randomization, 1 + randomization]
//!
//! RetryBackoff defaults (2 min initial, 4x multiplier, 3 h max, 0.2 jitter),
//! shown without jitter:
//! - Attempt 1: 2 min
//! - Attempt 2: 8 min
//! - Attempt 3: 32 min
//! - Attempt 4: 128 min
//! - Attempt 5+: capped at 3 h
//! ```
//!
//! `retry_at(first_failed_at, attempt)` sums the delays of all attempts so far,
//! so attempt 3 is retried 2 + 8 + 32 = 42 minutes after the first failure.
//!
//! ## Example
//!
//! ```ignore
//! let backoff = RetryBackoff::default();
//! let mut file = repo.files().get(&key).await?;
//! file.retryable.increment(&backoff, now, "upload failed");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::UtcTime;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound of a single delay, applied before jitter.
    pub max_interval: Duration,
    /// Relative jitter, 0.0 disables randomization.
    pub randomization_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            randomization_factor: 0.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier,
            max_interval,
            randomization_factor: 0.0,
        }
    }

    pub fn with_randomization(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry of the given attempt, attempts are numbered from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_interval.as_millis() as f64);

        let jittered_ms = if self.randomization_factor > 0.0 {
            let jitter = 1.0 - self.randomization_factor
                + rand::random::<f64>() * 2.0 * self.randomization_factor;
            capped_ms * jitter
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms.max(0.0) as u64)
    }
}

/// Retry schedule of Files and Slices.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    backoff: ExponentialBackoff,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                Duration::from_secs(2 * 60),
                4.0,
                Duration::from_secs(3 * 60 * 60),
            )
            .with_randomization(0.2),
        }
    }
}

impl RetryBackoff {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self { backoff }
    }

    /// Deterministic schedule, used in tests.
    pub fn no_randomization() -> Self {
        let mut backoff = Self::default();
        backoff.backoff.randomization_factor = 0.0;
        backoff
    }

    /// Delay of a single attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Time after which the attempt may be retried.
    pub fn retry_at(&self, first_failed_at: UtcTime, attempt: u32) -> UtcTime {
        let total: Duration = (1..=attempt).map(|a| self.backoff.delay(a)).sum();
        first_failed_at + total
    }
}

/// Persisted retry state, shared by File and Slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retryable {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<UtcTime>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Retryable {
    /// Record a failure and compute the next retry time.
    pub fn increment(&mut self, backoff: &RetryBackoff, now: UtcTime, reason: impl Into<String>) {
        let first_failed_at = *self.first_failed_at.get_or_insert(now);
        self.retry_attempt += 1;
        self.retry_reason = Some(reason.into());
        self.last_failed_at = Some(now);
        self.retry_after = Some(backoff.retry_at(first_failed_at, self.retry_attempt));
    }

    /// Clear the bookkeeping, called when the entity reaches a new state.
    pub fn reset(&mut self) {
        *self = Retryable::default();
    }

    /// True if the operation may be attempted at `now`.
    pub fn allowed_at(&self, now: UtcTime) -> bool {
        self.retry_after.map_or(true, |after| now >= after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn test_retry_backoff_delays() {
        let backoff = RetryBackoff::no_randomization();
        let delays: Vec<Duration> = (1..=7).map(|a| backoff.delay(a)).collect();
        assert_eq!(
            delays,
            vec![
                minutes(2),
                minutes(8),
                minutes(32),
                minutes(128),
                minutes(180),
                minutes(180),
                minutes(180),
            ]
        );
    }

    #[test]
    fn test_retry_at_sums_delays() {
        let backoff = RetryBackoff::no_randomization();
        let now = UtcTime::parse("2010-01-01T00:00:00.000Z").unwrap();
        assert_eq!(backoff.retry_at(now, 1).to_string(), "2010-01-01T00:02:00.000Z");
        assert_eq!(backoff.retry_at(now, 2).to_string(), "2010-01-01T00:10:00.000Z");
        assert_eq!(backoff.retry_at(now, 3).to_string(), "2010-01-01T00:42:00.000Z");
        assert_eq!(backoff.retry_at(now, 4).to_string(), "2010-01-01T02:50:00.000Z");
        assert_eq!(backoff.retry_at(now, 5).to_string(), "2010-01-01T05:50:00.000Z");
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(100), 2.0, Duration::from_secs(1000))
                .with_randomization(0.2);
        for _ in 0..100 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_secs(80) && d <= Duration::from_secs(120));
        }
    }

    #[test]
    fn test_retryable_increment_and_reset() {
        let backoff = RetryBackoff::no_randomization();
        let t1 = UtcTime::parse("2010-01-01T00:00:00.000Z").unwrap();
        let t2 = UtcTime::parse("2010-01-01T00:05:00.000Z").unwrap();

        let mut r = Retryable::default();
        assert!(r.allowed_at(t1));

        r.increment(&backoff, t1, "some error");
        r.increment(&backoff, t2, "some other error");
        assert_eq!(r.retry_attempt, 2);
        assert_eq!(r.retry_reason.as_deref(), Some("some other error"));
        assert_eq!(r.first_failed_at, Some(t1));
        assert_eq!(r.last_failed_at, Some(t2));
        assert_eq!(
            r.retry_after.map(|t| t.to_string()).as_deref(),
            Some("2010-01-01T00:10:00.000Z")
        );
        assert!(!r.allowed_at(t2));

        r.reset();
        assert_eq!(r, Retryable::default());
    }
}
