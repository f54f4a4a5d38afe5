//! Collaborator interfaces consumed by the engine.
//!
//! Production implementations (database, message broker, cache server) live
//! outside this crate. The in-memory ones in [`memory`] back the tests and
//! single-process embeddings; [`SqliteTaskStore`] is available behind the
//! `sqlite` feature.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::runner::AsyncTask;
use crate::task::{Task, TaskId};

pub use memory::{MemoryCache, MemoryTaskStore, MemoryTransport};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskStore;

/// Error type for collaborator operations.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Generate an id for a task about to be persisted.
    fn generate_id(&self) -> TaskId {
        TaskId::generate()
    }

    /// Persist tasks for later promotion. Tasks without an id get one.
    async fn add_tasks_to_scheduled(&self, tasks: Vec<Task>) -> Result<Vec<Task>, BackendError>;

    /// Claim scheduled tasks whose `execute_at` is at or before `now`.
    async fn get_mature_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, BackendError>;

    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> Result<(), BackendError>;

    /// Create or update by id. A null payload in the update keeps the stored one.
    async fn upsert_tasks(&self, tasks: Vec<Task>) -> Result<(), BackendError>;

    async fn get_tasks_by_ids(&self, ids: &[TaskId]) -> Result<Vec<Task>, BackendError>;
}

/// Callback invoked by a transport with each delivered batch.
pub type BatchHandler = Arc<dyn Fn(Vec<Task>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Live message queue.
///
/// Implementations must not deliver a message before its `execute_at`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn register(&self, queue: &str) -> Result<(), BackendError>;

    async fn add_messages(&self, queue: &str, tasks: Vec<Task>) -> Result<(), BackendError>;

    /// Deliver batches to `handler` until `cancel` fires or the handler fails.
    async fn consume_messages_stream(
        &self,
        queue: &str,
        handler: BatchHandler,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;

    /// Deliver at most one batch of up to `limit` messages. Returns how many
    /// messages were handed to `handler`.
    async fn consume_messages_batch(
        &self,
        queue: &str,
        handler: BatchHandler,
        limit: usize,
    ) -> Result<usize, BackendError>;
}

/// One write in a [`CacheBackend::pipeline`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    Get { key: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    /// Integer increment; the result is the new value. `ttl` refreshes expiry.
    IncrBy { key: String, delta: i64, ttl: Option<Duration> },
}

/// Lock and key/value cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Take `key` if nobody holds it. Returns whether the lock was acquired.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError>;

    async fn release(&self, key: &str) -> Result<(), BackendError>;

    async fn is_locked(&self, key: &str) -> Result<bool, BackendError>;

    /// Subset of `keys` currently locked.
    async fn locked_keys(&self, keys: &[String]) -> Result<HashSet<String>, BackendError> {
        let mut locked = HashSet::new();
        for key in keys {
            if self.is_locked(key).await? {
                locked.insert(key.clone());
            }
        }
        Ok(locked)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), BackendError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError>;

    /// Run commands in order; returns one result per command.
    async fn pipeline(&self, commands: Vec<CacheCommand>) -> Result<Vec<Option<String>>, BackendError>;
}

/// Items whose lock is not held by anyone. Items without a key pass through.
pub async fn filter_locked<T, F>(
    cache: &dyn CacheBackend,
    items: Vec<T>,
    key_fn: F,
) -> Result<Vec<T>, BackendError>
where
    F: Fn(&T) -> Option<String>,
{
    let keys: Vec<String> = items.iter().filter_map(&key_fn).collect();
    if keys.is_empty() {
        return Ok(items);
    }
    let locked = cache.locked_keys(&keys).await?;
    Ok(items
        .into_iter()
        .filter(|item| match key_fn(item) {
            Some(key) => !locked.contains(&key),
            None => true,
        })
        .collect())
}

/// Tracks tasks that outlived their handoff timeout.
#[async_trait]
pub trait AsyncTaskManager: Send + Sync {
    fn can_accept_task(&self) -> bool;

    /// Take ownership of a running task. A rejected task is handed back.
    async fn handoff_task(&self, task: AsyncTask) -> Result<(), AsyncTask>;
}
