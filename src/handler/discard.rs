//! Hourly counters for tasks dropped after their last retry.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, CacheBackend, CacheCommand};

/// Counters expire a little after they leave the 24h window.
const COUNTER_TTL: Duration = Duration::from_secs(25 * 3600);

pub fn hourly_key(queue: &str, at: DateTime<Utc>) -> String {
    format!("discarded:{queue}:{}", at.format("%Y%m%d%H"))
}

/// Records discards in per-hour cache counters.
pub struct DiscardTracker {
    cache: Arc<dyn CacheBackend>,
    sample_rate: f64,
}

impl DiscardTracker {
    pub fn new(cache: Arc<dyn CacheBackend>, sample_rate: f64) -> Self {
        Self {
            cache,
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }
    }

    /// Add `count` to the current hour. On a sampled call the rolling 24h
    /// total is recomputed and returned.
    pub async fn record(&self, queue: &str, count: u64, now: DateTime<Utc>) -> Result<Option<u64>, BackendError> {
        self.cache
            .pipeline(vec![CacheCommand::IncrBy {
                key: hourly_key(queue, now),
                delta: count as i64,
                ttl: Some(COUNTER_TTL),
            }])
            .await?;

        if rand::thread_rng().gen_bool(self.sample_rate) {
            Ok(Some(self.last_24h(queue, now).await?))
        } else {
            Ok(None)
        }
    }

    /// Sum of the counters for the 24 hours ending at `now`.
    pub async fn last_24h(&self, queue: &str, now: DateTime<Utc>) -> Result<u64, BackendError> {
        let keys: Vec<String> = (0..24)
            .map(|hours_ago| hourly_key(queue, now - chrono::Duration::hours(hours_ago)))
            .collect();
        let values = self.cache.mget(&keys).await?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|raw| raw.parse::<u64>().ok())
            .sum())
    }
}
