//! Retry policy for failed tasks.

use std::time::Duration;

use crate::task::Task;

/// Quadratic backoff with a hard cap.
///
/// The delay before retry `n` (0-indexed) is `retry_after * (n + 1)^2`,
/// never more than `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay used when a task carries no `retry_after`.
    pub default_retry_after: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_retry_after: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// What to do with a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`; `retry_count` is the new attempt count.
    Retry { retry_count: u32, delay: Duration },
    /// Attempts used up.
    Exhausted,
}

impl RetryPolicy {
    pub fn new(default_retry_after: Duration, max_delay: Duration) -> Self {
        Self {
            default_retry_after,
            max_delay,
        }
    }

    /// Delay before the retry that follows `retry_count` previous retries.
    pub fn delay_for(&self, retry_after: Option<Duration>, retry_count: u32) -> Duration {
        let base = retry_after.unwrap_or(self.default_retry_after).as_millis() as u64;
        let factor = (retry_count as u64 + 1).saturating_pow(2);
        let delay_ms = base.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as u64))
    }

    /// Decide between retry and exhaustion for a failed task.
    ///
    /// `default_retries` comes from the executor; the task's own `retries`
    /// overrides it.
    pub fn decide(&self, task: &Task, default_retries: u32) -> RetryDecision {
        let retry_count = task.execution_stats.retry_count;
        let max_retries = task.retries.unwrap_or(default_retries);
        if retry_count < max_retries {
            RetryDecision::Retry {
                retry_count: retry_count + 1,
                delay: self.delay_for(task.retry_after.map(Duration::from_millis), retry_count),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}
