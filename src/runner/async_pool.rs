//! Bounded in-process [`AsyncTaskManager`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::runner::AsyncTask;
use crate::backend::AsyncTaskManager;

/// Keeps handed-off tasks running in the background, up to a fixed capacity.
///
/// Finalizer errors are logged here since nobody else awaits the task.
#[derive(Clone)]
pub struct AsyncTaskPool {
    capacity: usize,
    in_flight: Arc<watch::Sender<usize>>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl AsyncTaskPool {
    pub fn new(capacity: usize) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            capacity,
            in_flight: Arc::new(in_flight),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Tasks whose finalizer succeeded.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Tasks whose execution or finalizer failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait until no handed-off task is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

#[async_trait]
impl AsyncTaskManager for AsyncTaskPool {
    fn can_accept_task(&self) -> bool {
        self.in_flight() < self.capacity
    }

    async fn handoff_task(&self, task: AsyncTask) -> Result<(), AsyncTask> {
        let capacity = self.capacity;
        let accepted = self.in_flight.send_if_modified(|count| {
            if *count < capacity {
                *count += 1;
                true
            } else {
                false
            }
        });
        if !accepted {
            return Err(task);
        }

        let key = task.task.context_key();
        let started_at = task.started_at;
        let in_flight = self.in_flight.clone();
        let completed = self.completed.clone();
        let failed = self.failed.clone();
        let completion = task.completion;

        tokio::spawn(async move {
            match completion.await {
                Ok(Ok(results)) => {
                    completed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        task = %key,
                        succeeded = results.success_tasks.len(),
                        failed = results.failed_tasks.len(),
                        elapsed_ms = (chrono::Utc::now() - started_at).num_milliseconds(),
                        "Async task finished"
                    );
                }
                Ok(Err(e)) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(task = %key, error = %e, "Async task finalization failed");
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(task = %key, error = %e, "Async task aborted");
                }
            }
            in_flight.send_modify(|count| *count = count.saturating_sub(1));
        });
        Ok(())
    }
}
