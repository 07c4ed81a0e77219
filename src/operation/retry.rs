//! Retry eligibility and exponential backoff.

use crate::operation::{Operation, OperationStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff and eligibility parameters for failed operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryPolicy {
    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor per retry
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter, as a fraction of the delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Failed operations older than this are no longer retried (seconds)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: i64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_max_age_secs() -> i64 {
    3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl RetryPolicy {
    /// Failed, under budget, and not older than the retry horizon.
    pub fn can_retry(&self, op: &Operation, now: DateTime<Utc>) -> bool {
        op.status == OperationStatus::Failed
            && op.retry_count < op.max_retries
            && now - op.timestamp <= ChronoDuration::seconds(self.max_age_secs)
    }

    /// `can_retry` and the scheduled retry time has passed.
    pub fn should_retry(&self, op: &Operation, now: DateTime<Utc>) -> bool {
        self.can_retry(op, now) && op.next_retry_at.map_or(true, |at| now >= at)
    }

    /// Un-jittered delay: `min(base * multiplier^(retry_count - 1), cap)`.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.max(1) - 1;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay with up to `jitter_ratio` of extra uniform jitter.
    pub fn delay_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry_count);
        let max_jitter = base.as_millis() as f64 * self.jitter_ratio;
        let jitter = if max_jitter > 0.0 {
            rng.gen_range(0.0..=max_jitter)
        } else {
            0.0
        };
        base + Duration::from_millis(jitter as u64)
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        self.delay_with(retry_count, &mut rand::thread_rng())
    }

    /// Wall-clock time of the next attempt for the given retry number.
    pub fn next_retry_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay(retry_count);
        now + ChronoDuration::milliseconds(delay.as_millis() as i64)
    }
}
