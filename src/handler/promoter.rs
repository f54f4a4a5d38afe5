//! Moves mature tasks from the scheduled store onto the transport.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::schedule::TaskScheduler;
use crate::backend::{BackendError, CacheBackend, CacheCommand, TaskStore};
use crate::task::Task;

/// Singleton lock shared by every worker's promotion loop.
pub const PROMOTION_LOCK_KEY: &str = "taskloom:promote_mature_tasks";

/// Keyed by id and due time, so a task rescheduled for a later retry gets a
/// fresh key and only a double pick of the same schedule is reported.
pub fn dedup_key(task: &Task) -> Option<String> {
    task.id
        .as_ref()
        .map(|id| format!("promoted:{id}:{}", task.execute_at.timestamp_millis()))
}

pub struct MaturePromoter {
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn CacheBackend>,
    scheduler: TaskScheduler,
    lock_ttl: Duration,
    dedup_ttl: Duration,
}

impl MaturePromoter {
    pub fn new(
        store: Arc<dyn TaskStore>,
        cache: Arc<dyn CacheBackend>,
        scheduler: TaskScheduler,
        lock_ttl: Duration,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            scheduler,
            lock_ttl,
            dedup_ttl,
        }
    }

    /// One promotion pass. Returns how many tasks were promoted; 0 when
    /// another worker holds the promotion lock.
    pub async fn promote_once(&self) -> Result<usize, BackendError> {
        if !self.cache.acquire(PROMOTION_LOCK_KEY, self.lock_ttl).await? {
            debug!("Promotion lock held elsewhere; skipping tick");
            return Ok(0);
        }

        let result = self.promote_locked().await;

        if let Err(e) = self.cache.release(PROMOTION_LOCK_KEY).await {
            warn!(error = %e, "Failed to release promotion lock");
        }
        result
    }

    async fn promote_locked(&self) -> Result<usize, BackendError> {
        let tasks = self.store.get_mature_tasks(Utc::now()).await?;
        if tasks.is_empty() {
            debug!("No mature tasks");
            return Ok(0);
        }

        let duplicates = self.detect_duplicates(&tasks).await;
        let count = tasks.len();
        // Mature tasks are due now; force_store would send them straight back.
        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                task.force_store = false;
                task
            })
            .collect();
        self.scheduler.add_tasks(tasks).await?;
        info!(count, duplicates, "Promoted mature tasks");
        Ok(count)
    }

    /// Warn about tasks promoted before within the dedup window and return
    /// how many there were. Advisory only: failures are logged and never
    /// block promotion.
    async fn detect_duplicates(&self, tasks: &[Task]) -> usize {
        let keys: Vec<String> = tasks.iter().filter_map(dedup_key).collect();
        if keys.is_empty() {
            return 0;
        }

        let duplicates = match self.cache.mget(&keys).await {
            Ok(seen) => {
                let duplicates: Vec<&String> = keys
                    .iter()
                    .zip(seen)
                    .filter_map(|(key, seen)| seen.map(|_| key))
                    .collect();
                if !duplicates.is_empty() {
                    warn!(
                        count = duplicates.len(),
                        keys = ?duplicates,
                        "Mature tasks promoted more than once"
                    );
                }
                duplicates.len()
            }
            Err(e) => {
                warn!(error = %e, "Duplicate check failed");
                0
            }
        };

        let stamp = Utc::now().to_rfc3339();
        let writes = keys
            .into_iter()
            .map(|key| CacheCommand::Set {
                key,
                value: stamp.clone(),
                ttl: Some(self.dedup_ttl),
            })
            .collect();
        if let Err(e) = self.cache.pipeline(writes).await {
            warn!(error = %e, "Failed to record promoted task ids");
        }
        duplicates
    }
}
