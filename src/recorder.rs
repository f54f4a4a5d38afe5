//! Lifecycle event interface for external observers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::stats::{QueueStatsSnapshot, WorkerInfo, WorkerStatsSnapshot};
use crate::task::Task;

/// Read-only event emitted at each lifecycle transition.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A task was routed to the transport (`immediate`) or the scheduled store.
    TaskScheduled { task: Task, immediate: bool },
    TaskStarted { task: Task },
    TaskCompleted { task: Task },
    TaskFailed { task: Task, error: Option<String> },
    /// A never-persisted task ran out of retries and was dropped.
    TaskExhausted { task: Task, error: Option<String> },
    WorkerStarted { worker: WorkerInfo },
    WorkerHeartbeat { worker: WorkerInfo, stats: WorkerStatsSnapshot },
    WorkerStopped { worker: WorkerInfo, stats: WorkerStatsSnapshot },
    BatchStarted { queue: String, size: usize },
    BatchCompleted {
        queue: String,
        size: usize,
        succeeded: usize,
        failed: usize,
        ignored: usize,
        handed_off: usize,
        duration: Duration,
    },
    QueueStats { queue: String, stats: QueueStatsSnapshot },
    /// `last_24h` is only filled in on sampled recomputations.
    TasksDiscarded { queue: String, count: u64, last_24h: Option<u64> },
}

impl LifecycleEvent {
    /// Short event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskExhausted { .. } => "task_exhausted",
            Self::WorkerStarted { .. } => "worker_started",
            Self::WorkerHeartbeat { .. } => "worker_heartbeat",
            Self::WorkerStopped { .. } => "worker_stopped",
            Self::BatchStarted { .. } => "batch_started",
            Self::BatchCompleted { .. } => "batch_completed",
            Self::QueueStats { .. } => "queue_stats",
            Self::TasksDiscarded { .. } => "tasks_discarded",
        }
    }
}

/// Receives lifecycle events. Errors are logged by the caller and never
/// affect task processing.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// A no-op recorder that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopRecorder;

impl NoopRecorder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recorder for NoopRecorder {
    async fn record(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fans events out to every configured recorder, swallowing their errors.
#[derive(Clone, Default)]
pub struct EventSink {
    recorders: Vec<Arc<dyn Recorder>>,
}

impl EventSink {
    pub fn new(recorders: Vec<Arc<dyn Recorder>>) -> Self {
        Self { recorders }
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    pub async fn emit(&self, event: LifecycleEvent) {
        for recorder in &self.recorders {
            if let Err(e) = recorder.record(&event).await {
                tracing::warn!(event = event.name(), error = %e, "Recorder failed");
            }
        }
    }

    pub async fn emit_all(&self, events: Vec<LifecycleEvent>) {
        if self.recorders.is_empty() {
            return;
        }
        for event in events {
            self.emit(event).await;
        }
    }
}
