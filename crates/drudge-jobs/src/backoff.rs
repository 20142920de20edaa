//! Retry policy: exponential backoff with bounded jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use drudge_core::{defaults, Job};

/// Largest jitter ratio accepted; below 1 so delays never decrease between attempts.
const MAX_JITTER_RATIO: f64 = 0.99;

/// What happens to a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again no earlier than `run_at`.
    Retry { run_at: DateTime<Utc> },
    /// Every attempt is used up; the job is archived as permanently failed.
    Exhausted,
}

/// Computes when a failed job may run again.
///
/// The delay after the n-th failed attempt is
/// `min(base * 2^(n-1) * (1 + r), max_delay)` with `r` uniform in
/// `[0, jitter_ratio)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(defaults::BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(defaults::BACKOFF_MAX_MS),
            jitter_ratio: defaults::BACKOFF_JITTER_RATIO,
        }
    }
}

impl BackoffPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DRUDGE_BACKOFF_BASE_MS` | `2000` | Delay after the first failure |
    /// | `DRUDGE_BACKOFF_MAX_MS` | `3600000` | Upper bound on any delay |
    /// | `DRUDGE_BACKOFF_JITTER` | `0.25` | Jitter ratio, below 1 |
    pub fn from_env() -> Self {
        let default = Self::default();
        let base = std::env::var("DRUDGE_BACKOFF_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(default.base);
        let max_delay = std::env::var("DRUDGE_BACKOFF_MAX_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(default.max_delay);
        let jitter_ratio = std::env::var("DRUDGE_BACKOFF_JITTER")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(default.jitter_ratio);

        Self::default()
            .with_base(base)
            .with_max_delay(max_delay)
            .with_jitter_ratio(jitter_ratio)
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter ratio, clamped to `[0, 0.99]`.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, MAX_JITTER_RATIO)
        } else {
            0.0
        };
        self
    }

    /// Delay after `attempts` executions for a jitter sample in `[0, 1)`.
    pub fn delay_with_sample(&self, attempts: i32, sample: f64) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 62);
        let jitter = 1.0 + self.jitter_ratio * sample.clamp(0.0, 1.0);
        let millis = self.base.as_millis() as f64 * 2f64.powi(exponent) * jitter;
        let max = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(max) as u64)
    }

    /// Delay after `attempts` executions with a random jitter sample.
    pub fn delay(&self, attempts: i32) -> Duration {
        let sample: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_sample(attempts, sample)
    }

    /// Decide the fate of `job` after a failed execution at `now`.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        if job.attempts >= job.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = chrono::Duration::from_std(self.delay(job.attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(defaults::BACKOFF_MAX_MS as i64 / 1000));
        RetryDecision::Retry { run_at: now + delay }
    }
}
