//! In-memory collaborators for tests and single-process runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{BackendError, BatchHandler, CacheBackend, CacheCommand, TaskStore, Transport};
use crate::task::{Task, TaskId, TaskStatus};

/// Task store backed by a `HashMap`.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by(|a, b| a.execute_at.cmp(&b.execute_at));
        tasks
    }

    pub fn with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.snapshot()
            .into_iter()
            .filter(|task| task.status == status)
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn add_tasks_to_scheduled(&self, tasks: Vec<Task>) -> Result<Vec<Task>, BackendError> {
        let now = Utc::now();
        let mut guard = self.tasks.lock();
        let mut stored = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.ensure_id(|| self.generate_id());
            task.status = TaskStatus::Scheduled;
            task.created_at.get_or_insert(now);
            task.updated_at = Some(now);
            if let Some(id) = task.id.clone() {
                guard.insert(id, task.clone());
            }
            stored.push(task);
        }
        Ok(stored)
    }

    async fn get_mature_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, BackendError> {
        let mut guard = self.tasks.lock();
        let mut mature: Vec<Task> = guard
            .values_mut()
            .filter(|task| task.status == TaskStatus::Scheduled && task.execute_at <= now)
            .map(|task| {
                task.status = TaskStatus::Processing;
                task.processing_started_at = Some(now);
                task.updated_at = Some(now);
                task.clone()
            })
            .collect();
        mature.sort_by(|a, b| a.execute_at.cmp(&b.execute_at));
        Ok(mature)
    }

    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut guard = self.tasks.lock();
        for task in tasks {
            if let Some(stored) = task.id.as_ref().and_then(|id| guard.get_mut(id)) {
                stored.status = TaskStatus::Executed;
                stored.updated_at = Some(now);
            }
        }
        Ok(())
    }

    async fn upsert_tasks(&self, tasks: Vec<Task>) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut guard = self.tasks.lock();
        for mut task in tasks {
            let id = task.id.clone().ok_or_else(|| {
                BackendError::Storage(format!("upsert of task without id (type {})", task.task_type))
            })?;
            if let Some(existing) = guard.get(&id) {
                if task.payload.is_null() {
                    task.payload = existing.payload.clone();
                }
                task.created_at = existing.created_at.or(task.created_at);
            } else {
                task.created_at.get_or_insert(now);
            }
            task.updated_at = Some(now);
            task.transient_key = None;
            guard.insert(id, task);
        }
        Ok(())
    }

    async fn get_tasks_by_ids(&self, ids: &[TaskId]) -> Result<Vec<Task>, BackendError> {
        let guard = self.tasks.lock();
        Ok(ids.iter().filter_map(|id| guard.get(id).cloned()).collect())
    }
}

/// Transport backed by per-queue buffers.
///
/// Messages stay buffered until their `execute_at` passes. When a handler
/// fails, its batch goes back to the front of the queue.
#[derive(Clone)]
pub struct MemoryTransport {
    queues: Arc<Mutex<HashMap<String, Vec<Task>>>>,
    registered: Arc<Mutex<HashSet<String>>>,
    notify: Arc<Notify>,
    batch_size: usize,
    poll_interval: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            registered: Arc::new(Mutex::new(HashSet::new())),
            notify: Arc::new(Notify::new()),
            batch_size: 50,
            poll_interval: Duration::from_millis(25),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_registered(&self, queue: &str) -> bool {
        self.registered.lock().contains(queue)
    }

    /// Messages waiting in `queue`, due or not.
    pub fn pending(&self, queue: &str) -> Vec<Task> {
        self.queues.lock().get(queue).cloned().unwrap_or_default()
    }

    fn take_due(&self, queue: &str, limit: usize) -> Vec<Task> {
        let now = Utc::now();
        let mut guard = self.queues.lock();
        let Some(buffer) = guard.get_mut(queue) else {
            return Vec::new();
        };
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(buffer.len());
        for task in buffer.drain(..) {
            if taken.len() < limit && task.execute_at <= now {
                taken.push(task);
            } else {
                kept.push(task);
            }
        }
        *buffer = kept;
        taken
    }

    fn put_back(&self, queue: &str, tasks: Vec<Task>) {
        let mut guard = self.queues.lock();
        let buffer = guard.entry(queue.to_string()).or_default();
        let rest = std::mem::take(buffer);
        buffer.extend(tasks);
        buffer.extend(rest);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn register(&self, queue: &str) -> Result<(), BackendError> {
        self.registered.lock().insert(queue.to_string());
        self.queues.lock().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn add_messages(&self, queue: &str, tasks: Vec<Task>) -> Result<(), BackendError> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .extend(tasks);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume_messages_stream(
        &self,
        queue: &str,
        handler: BatchHandler,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let batch = self.take_due(queue, self.batch_size);
            if batch.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }

            if let Err(e) = handler(batch.clone()).await {
                self.put_back(queue, batch);
                return Err(BackendError::Transport(format!("batch handler failed: {e:#}")));
            }
        }
    }

    async fn consume_messages_batch(
        &self,
        queue: &str,
        handler: BatchHandler,
        limit: usize,
    ) -> Result<usize, BackendError> {
        let batch = self.take_due(queue, limit);
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        if let Err(e) = handler(batch.clone()).await {
            self.put_back(queue, batch);
            return Err(BackendError::Transport(format!("batch handler failed: {e:#}")));
        }
        Ok(count)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// TTL'd key/value cache with `SET NX` style locks.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .count()
    }

    fn live_value(entries: &HashMap<String, CacheEntry>, key: &str, now: Instant) -> Option<String> {
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    fn expiry(ttl: Option<Duration>, now: Instant) -> Option<Instant> {
        ttl.map(|ttl| now + ttl)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut guard = self.entries.lock();
        if Self::live_value(&guard, key, now).is_some() {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            CacheEntry {
                value: "1".to_string(),
                expires_at: Self::expiry(Some(ttl), now),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), BackendError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn is_locked(&self, key: &str) -> Result<bool, BackendError> {
        Ok(Self::live_value(&self.entries.lock(), key, Instant::now()).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(Self::live_value(&self.entries.lock(), key, Instant::now()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), BackendError> {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Self::expiry(ttl, now),
            },
        );
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
        let now = Instant::now();
        let guard = self.entries.lock();
        Ok(keys
            .iter()
            .map(|key| Self::live_value(&guard, key, now))
            .collect())
    }

    async fn pipeline(&self, commands: Vec<CacheCommand>) -> Result<Vec<Option<String>>, BackendError> {
        let now = Instant::now();
        let mut guard = self.entries.lock();
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            match command {
                CacheCommand::Get { key } => results.push(Self::live_value(&guard, &key, now)),
                CacheCommand::Set { key, value, ttl } => {
                    guard.insert(
                        key,
                        CacheEntry {
                            value,
                            expires_at: Self::expiry(ttl, now),
                        },
                    );
                    results.push(None);
                }
                CacheCommand::IncrBy { key, delta, ttl } => {
                    let current = match Self::live_value(&guard, &key, now) {
                        Some(value) => value.parse::<i64>().map_err(|e| {
                            BackendError::Cache(format!("value at {key} is not an integer: {e}"))
                        })?,
                        None => 0,
                    };
                    let next = current + delta;
                    let previous_expiry = guard.get(&key).and_then(|entry| entry.expires_at);
                    guard.insert(
                        key,
                        CacheEntry {
                            value: next.to_string(),
                            expires_at: Self::expiry(ttl, now).or(previous_expiry),
                        },
                    );
                    results.push(Some(next.to_string()));
                }
            }
        }
        Ok(results)
    }
}
