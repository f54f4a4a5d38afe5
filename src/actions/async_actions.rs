//! Finalizer for tasks that outlived their handoff timeout.

use std::sync::Arc;
use thiserror::Error;

use super::accumulator::Actions;
use super::context::ActionResults;
use crate::backend::{BackendError, TaskStore};
use crate::handler::TaskScheduler;
use crate::task::{Task, TaskStatus};

/// Error raised while finalizing a handed-off task.
#[derive(Error, Debug)]
pub enum FinalizeError {
    /// The executor finished without calling success or fail.
    #[error("async task {key} completed without recording success or fail")]
    MissingOutcome { key: String },

    /// The execution was aborted before it settled; nothing was persisted.
    #[error("async task {key} was aborted before it finished")]
    Aborted { key: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Owns one handed-off task's outcome context.
///
/// The sync harvest skips the task's key, so this is the only reader of it.
pub struct AsyncActions {
    task: Task,
    actions: Actions,
    store: Arc<dyn TaskStore>,
    scheduler: TaskScheduler,
}

impl AsyncActions {
    pub fn new(task: Task, actions: Actions, store: Arc<dyn TaskStore>, scheduler: TaskScheduler) -> Self {
        Self {
            task,
            actions,
            store,
            scheduler,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Harvest and persist the task's outcome once its execution has settled.
    pub async fn on_completed(&self) -> Result<ActionResults, FinalizeError> {
        let key = self.task.context_key();
        let results = self.actions.extract_task_actions(&key);

        if results.success_tasks.is_empty() && results.failed_tasks.is_empty() {
            tracing::error!(
                run_id = %self.actions.run_id(),
                task = %key,
                task_type = %self.task.task_type,
                "Async task finished without an outcome"
            );
            return Err(FinalizeError::MissingOutcome { key });
        }

        if !results.failed_tasks.is_empty() {
            let failed: Vec<Task> = results
                .failed_tasks
                .iter()
                .cloned()
                .map(|mut task| {
                    task.status = TaskStatus::Failed;
                    task
                })
                .collect();
            self.store.upsert_tasks(failed).await?;
        }

        if !results.success_tasks.is_empty() {
            self.store.mark_tasks_as_executed(&results.success_tasks).await?;
        }

        if !results.new_tasks.is_empty() {
            self.scheduler.add_tasks(results.new_tasks.clone()).await?;
        }

        tracing::debug!(
            task = %key,
            succeeded = results.success_tasks.len(),
            failed = results.failed_tasks.len(),
            new_tasks = results.new_tasks.len(),
            "Finalized async task"
        );
        Ok(results)
    }
}
