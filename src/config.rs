//! Handler configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables for a [`TaskHandler`](crate::TaskHandler).
///
/// `Default` gives the production values; tests usually shorten the
/// intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    /// Suffix appended to every queue name (`emails` becomes `emails-<env>`).
    pub environment: Option<String>,
    /// Tasks due within this window go straight to the transport.
    pub immediate_window: Duration,
    pub retry: RetryPolicy,
    /// Attempts allowed when neither the task nor its executor says otherwise.
    pub default_retries: u32,
    pub task_lock_ttl: Duration,
    pub promotion_interval: Duration,
    pub promotion_lock_ttl: Duration,
    /// How long a promoted task id is remembered for duplicate detection.
    pub dedup_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// How far a group is pushed out when the async manager is full.
    pub backpressure_delay: Duration,
    /// How far a task is pushed out when the async manager rejects it.
    pub handoff_rejected_delay: Duration,
    pub flush_processed_threshold: u64,
    pub flush_failed_threshold: u64,
    /// Fraction of discard events that also recompute the rolling 24h total.
    pub discard_sample_rate: f64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            environment: None,
            immediate_window: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            default_retries: 3,
            task_lock_ttl: Duration::from_secs(300),
            promotion_interval: Duration::from_secs(5),
            promotion_lock_ttl: Duration::from_secs(20),
            dedup_ttl: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(5),
            backpressure_delay: Duration::from_secs(180),
            handoff_rejected_delay: Duration::from_secs(30),
            flush_processed_threshold: 1000,
            flush_failed_threshold: 100,
            discard_sample_rate: 0.1,
        }
    }
}

impl HandlerConfig {
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn promotion_interval(mut self, interval: Duration) -> Self {
        self.promotion_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn discard_sample_rate(mut self, rate: f64) -> Self {
        self.discard_sample_rate = rate.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HandlerConfig::default();
        assert_eq!(config.immediate_window, Duration::from_secs(120));
        assert_eq!(config.retry.max_delay, Duration::from_secs(300));
        assert_eq!(config.promotion_lock_ttl, Duration::from_secs(20));
        assert_eq!(config.backpressure_delay, Duration::from_secs(180));
        assert_eq!(config.flush_processed_threshold, 1000);
    }

    #[test]
    fn test_sample_rate_is_clamped() {
        assert_eq!(HandlerConfig::default().discard_sample_rate(4.0).discard_sample_rate, 1.0);
    }
}
