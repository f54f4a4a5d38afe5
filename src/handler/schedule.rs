//! Immediate-vs-future routing of new tasks.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, TaskStore, Transport};
use crate::recorder::{EventSink, LifecycleEvent};
use crate::registry::ExecutorRegistry;
use crate::task::Task;

/// Split tasks into those due within `window` of `now` and those that must
/// wait in the scheduled store. `force_store` always goes to the store.
pub fn partition(tasks: Vec<Task>, now: DateTime<Utc>, window: Duration) -> (Vec<Task>, Vec<Task>) {
    let horizon = chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window));
    tasks
        .into_iter()
        .partition(|task| !task.force_store && horizon.map_or(true, |h| task.execute_at <= h))
}

/// Routes new tasks to the transport or the scheduled store.
#[derive(Clone)]
pub struct TaskScheduler {
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn Transport>,
    events: EventSink,
    immediate_window: Duration,
}

impl TaskScheduler {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn Transport>,
        events: EventSink,
        immediate_window: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            transport,
            events,
            immediate_window,
        }
    }

    /// Schedule tasks. Returns how many went to the transport and how many
    /// to the scheduled store.
    ///
    /// Immediate tasks get an id up front only when their executor uses
    /// `store_on_failure`, so a later failure can be persisted under it.
    pub async fn add_tasks(&self, tasks: Vec<Task>) -> Result<(usize, usize), BackendError> {
        if tasks.is_empty() {
            return Ok((0, 0));
        }
        let (mut immediate, future) = partition(tasks, Utc::now(), self.immediate_window);

        for task in &mut immediate {
            let store_on_failure = self
                .registry
                .get_options(&task.queue_id, &task.task_type)
                .map(|options| options.store_on_failure)
                .unwrap_or(false);
            if store_on_failure {
                task.ensure_id(|| self.store.generate_id());
            }
        }

        let mut by_queue: HashMap<String, Vec<Task>> = HashMap::new();
        for task in &immediate {
            by_queue
                .entry(self.registry.namer().normalize(&task.queue_id))
                .or_default()
                .push(task.clone());
        }
        for (queue, tasks) in by_queue {
            tracing::debug!(queue = %queue, count = tasks.len(), "Sending tasks to transport");
            self.transport.add_messages(&queue, tasks).await?;
        }

        let stored = if future.is_empty() {
            Vec::new()
        } else {
            let stored = self.store.add_tasks_to_scheduled(future).await?;
            tracing::debug!(count = stored.len(), "Stored future tasks");
            stored
        };

        let counts = (immediate.len(), stored.len());
        if !self.events.is_empty() {
            let events = immediate
                .into_iter()
                .map(|task| LifecycleEvent::TaskScheduled { task, immediate: true })
                .chain(
                    stored
                        .into_iter()
                        .map(|task| LifecycleEvent::TaskScheduled { task, immediate: false }),
                )
                .collect();
            self.events.emit_all(events).await;
        }
        Ok(counts)
    }
}
