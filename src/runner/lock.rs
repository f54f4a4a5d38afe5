//! Scoped guard over the per-task locks of one run.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, CacheBackend};

/// Locks acquired for one run.
///
/// Call [`LockBatch::release`] on the normal path. If the guard is dropped
/// while still holding keys (the run future was dropped or unwound), the
/// release is spawned onto the current runtime; the lock TTL covers the case
/// where no runtime is left.
pub struct LockBatch {
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
    held: Vec<String>,
}

impl LockBatch {
    pub fn new(cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            held: Vec::new(),
        }
    }

    /// Try to take `key`. Returns false if another worker holds it.
    pub async fn acquire(&mut self, key: &str) -> Result<bool, BackendError> {
        let acquired = self.cache.acquire(key, self.ttl).await?;
        if acquired {
            self.held.push(key.to_string());
        }
        Ok(acquired)
    }

    pub fn held(&self) -> &[String] {
        &self.held
    }

    /// Release every held lock. Failures are logged.
    pub async fn release(mut self) {
        let keys = std::mem::take(&mut self.held);
        release_all(self.cache.as_ref(), keys).await;
    }
}

async fn release_all(cache: &dyn CacheBackend, keys: Vec<String>) {
    for key in keys {
        if let Err(e) = cache.release(&key).await {
            tracing::warn!(lock = %key, error = %e, "Failed to release task lock");
        }
    }
}

impl Drop for LockBatch {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.held);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = self.cache.clone();
                handle.spawn(async move { release_all(cache.as_ref(), keys).await });
            }
            Err(_) => {
                tracing::warn!(count = keys.len(), "No runtime to release task locks; leaving them to expire");
            }
        }
    }
}
