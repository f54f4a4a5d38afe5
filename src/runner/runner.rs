//! Per-batch orchestration: lock, group, dispatch, race, harvest.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::lock::LockBatch;
use crate::actions::{ActionResults, Actions, AsyncActions, FinalizeError, TaskResultStatus};
use crate::backend::{filter_locked, AsyncTaskManager, BackendError, CacheBackend, TaskStore};
use crate::executor::{AsyncConfig, ExecutorError};
use crate::handler::TaskScheduler;
use crate::recorder::{EventSink, LifecycleEvent};
use crate::registry::{ExecutorRegistry, RegisteredExecutor};
use crate::task::{Task, TaskStatus};

/// Error that aborts a run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A task still executing after its handoff timeout.
///
/// `completion` resolves once the execution settles and its finalizer has
/// persisted the outcome.
pub struct AsyncTask {
    pub task: Task,
    pub started_at: DateTime<Utc>,
    pub completion: JoinHandle<Result<ActionResults, FinalizeError>>,
    pub finalizer: Arc<AsyncActions>,
    execution: AbortHandle,
}

impl AsyncTask {
    /// Abort the execution and wait for the completion task to settle.
    ///
    /// Returns the task when the abort landed before the execution finished.
    /// Returns `None` when the execution had already settled, in which case
    /// the finalizer has persisted its outcome and the task must not run again.
    pub async fn cancel(self) -> Option<Task> {
        self.execution.abort();
        let key = self.task.context_key();
        match self.completion.await {
            Ok(Err(FinalizeError::Aborted { .. })) => Some(self.task),
            Ok(Ok(_)) => {
                tracing::debug!(task = %key, "Execution settled before cancellation; keeping its outcome");
                None
            }
            Ok(Err(e)) => {
                tracing::error!(task = %key, error = %e, "Async task finalization failed");
                None
            }
            Err(e) => {
                tracing::error!(task = %key, error = %e, "Async task completion crashed");
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("task", &self.task.context_key())
            .field("task_type", &self.task.task_type)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Outcome of one run.
#[derive(Debug, Default)]
pub struct RunResult {
    /// Sync-harvested outcome: successes, failures, new and ignored tasks.
    pub outcome: ActionResults,
    pub async_tasks: Vec<AsyncTask>,
    /// Tasks pushed back to the store because the async manager was full.
    pub deferred: usize,
    /// Tasks that could be neither run nor rescheduled; the caller returns
    /// them to the transport.
    pub undelivered: Vec<Task>,
}

impl RunResult {
    pub fn handed_off(&self) -> usize {
        self.async_tasks.len()
    }
}

/// Runs one batch of tasks from a queue.
pub struct TaskRunner {
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn CacheBackend>,
    scheduler: TaskScheduler,
    async_manager: Option<Arc<dyn AsyncTaskManager>>,
    events: EventSink,
    lock_ttl: Duration,
    backpressure_delay: Duration,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        store: Arc<dyn TaskStore>,
        cache: Arc<dyn CacheBackend>,
        scheduler: TaskScheduler,
        async_manager: Option<Arc<dyn AsyncTaskManager>>,
        events: EventSink,
        lock_ttl: Duration,
        backpressure_delay: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
            scheduler,
            async_manager,
            events,
            lock_ttl,
            backpressure_delay,
        }
    }

    /// Run a batch.
    ///
    /// Tasks whose lock is held elsewhere are skipped. Every lock taken here
    /// is released before returning, whatever the executors did.
    pub async fn run(
        &self,
        queue: &str,
        mut tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, RunError> {
        if cancel.is_cancelled() || tasks.is_empty() {
            return Ok(RunResult::default());
        }

        for task in &mut tasks {
            task.ensure_transient_key();
        }

        let candidates = filter_locked(self.cache.as_ref(), tasks, Task::lock_key).await?;
        let mut locks = LockBatch::new(self.cache.clone(), self.lock_ttl);
        let mut runnable = Vec::with_capacity(candidates.len());
        for task in candidates {
            let Some(key) = task.lock_key() else {
                runnable.push(task);
                continue;
            };
            match locks.acquire(&key).await {
                Ok(true) => runnable.push(task),
                Ok(false) => {
                    tracing::debug!(queue, lock = %key, "Task locked by another worker; skipping");
                }
                Err(e) => {
                    tracing::warn!(queue, lock = %key, error = %e, "Failed to acquire task lock; skipping");
                }
            }
        }

        let actions = Actions::new(uuid::Uuid::new_v4().to_string());
        let result = self.dispatch(queue, runnable, &actions).await;
        locks.release().await;
        Ok(result)
    }

    async fn dispatch(&self, queue: &str, tasks: Vec<Task>, actions: &Actions) -> RunResult {
        let mut result = RunResult::default();
        let mut excluded = HashSet::new();

        for (task_type, group) in group_by_type(tasks) {
            let Some(registered) = self.registry.get_executor(queue, &task_type) else {
                tracing::debug!(queue, task_type = %task_type, count = group.len(), "No executor; ignoring tasks");
                self.ignore(group, actions);
                continue;
            };

            if registered.options.async_config.is_some() {
                if let Some(manager) = &self.async_manager {
                    if !manager.can_accept_task() {
                        match self.defer(queue, &task_type, group.clone()).await {
                            Ok(count) => result.deferred += count,
                            Err(e) => {
                                tracing::warn!(
                                    queue,
                                    task_type = %task_type,
                                    error = %e,
                                    "Failed to reschedule tasks; returning them to the transport"
                                );
                                result.undelivered.extend(group);
                            }
                        }
                        continue;
                    }
                }
            }

            if registered.options.multiple {
                self.run_multiple(&registered, group, actions).await;
            } else if registered.options.parallel {
                self.run_parallel(&registered, group, actions).await;
            } else {
                for task in group {
                    let handed_off = match registered.options.async_config {
                        Some(config) => self.run_racing(&registered, task, config, actions, &mut excluded).await,
                        None => {
                            self.run_serial(&registered, task, actions).await;
                            None
                        }
                    };
                    result.async_tasks.extend(handed_off);
                }
            }
        }

        result.outcome = actions.extract_sync_results(&excluded);
        result
    }

    fn ignore(&self, group: Vec<Task>, actions: &Actions) {
        let now = Utc::now();
        for mut task in group {
            task.ensure_id(|| self.store.generate_id());
            task.execution_stats.ignored_at = Some(now);
            task.execution_stats.ignored_reason = Some("no executor registered".to_string());
            actions.add_ignored_task(&task);
        }
    }

    /// Push a group back to the scheduled store when the async manager is full.
    async fn defer(&self, queue: &str, task_type: &str, group: Vec<Task>) -> Result<usize, BackendError> {
        let execute_at = Utc::now() + chrono::Duration::from_std(self.backpressure_delay).unwrap_or_else(|_| chrono::Duration::zero());
        let deferred: Vec<Task> = group
            .into_iter()
            .map(|mut task| {
                task.ensure_id(|| self.store.generate_id());
                task.status = TaskStatus::Scheduled;
                task.execute_at = execute_at;
                task
            })
            .collect();
        let count = deferred.len();
        tracing::info!(queue, task_type, count, "Async manager at capacity; rescheduling tasks");
        self.store.upsert_tasks(deferred).await?;
        Ok(count)
    }

    async fn run_multiple(&self, registered: &RegisteredExecutor, group: Vec<Task>, actions: &Actions) {
        for task in &group {
            actions.fork_for_task(task);
        }
        self.emit_started(&group).await;

        let outcome = guarded(registered.executor.execute_multiple(group.clone(), actions.clone())).await;
        if let Err(e) = outcome {
            tracing::warn!(task_type = %group[0].task_type, count = group.len(), error = %e, "Batched executor failed");
            let message = e.to_string();
            for task in &group {
                actions.fail_if_pending(task, &message);
            }
        }

        for task in &group {
            self.emit_outcome(actions, task).await;
        }
    }

    async fn run_parallel(&self, registered: &RegisteredExecutor, group: Vec<Task>, actions: &Actions) {
        for chunk in group.chunks(registered.options.chunk_size.max(1)) {
            self.emit_started(chunk).await;

            let runs = chunk.iter().map(|task| {
                let handle = actions.fork_for_task(task);
                let executor = registered.executor.clone();
                let task = task.clone();
                async move {
                    let outcome = guarded(executor.execute(task.clone(), handle)).await;
                    (task, outcome)
                }
            });

            for (task, outcome) in futures::future::join_all(runs).await {
                if let Err(e) = outcome {
                    tracing::warn!(task = %task.context_key(), error = %e, "Executor failed");
                    actions.fail_if_pending(&task, &e.to_string());
                }
                self.emit_outcome(actions, &task).await;
            }
        }
    }

    async fn run_serial(&self, registered: &RegisteredExecutor, task: Task, actions: &Actions) {
        self.emit_started(std::slice::from_ref(&task)).await;
        let handle = actions.fork_for_task(&task);
        if let Err(e) = guarded(registered.executor.execute(task.clone(), handle)).await {
            tracing::warn!(task = %task.context_key(), error = %e, "Executor failed");
            actions.fail_if_pending(&task, &e.to_string());
        }
        self.emit_outcome(actions, &task).await;
    }

    /// Race one execution against its handoff timeout. Returns the task as an
    /// [`AsyncTask`] if the timer won and the task can be tracked.
    async fn run_racing(
        &self,
        registered: &RegisteredExecutor,
        task: Task,
        config: AsyncConfig,
        actions: &Actions,
        excluded: &mut HashSet<String>,
    ) -> Option<AsyncTask> {
        self.emit_started(std::slice::from_ref(&task)).await;
        let started_at = Utc::now();
        let handle = actions.fork_for_task(&task);
        let executor = registered.executor.clone();
        let run_task = task.clone();
        let mut execution = tokio::spawn(async move { guarded(executor.execute(run_task, handle)).await });

        match tokio::time::timeout(config.handoff_timeout, &mut execution).await {
            Ok(joined) => {
                if let Err(e) = flatten(joined) {
                    tracing::warn!(task = %task.context_key(), error = %e, "Executor failed");
                    actions.fail_if_pending(&task, &e.to_string());
                }
                self.emit_outcome(actions, &task).await;
                None
            }
            Err(_) => {
                excluded.insert(task.context_key());
                if task.id.is_none() {
                    tracing::warn!(
                        task_type = %task.task_type,
                        timeout_ms = config.handoff_timeout.as_millis() as u64,
                        "Task without id outlived its handoff timeout; continuing untracked"
                    );
                    return None;
                }

                tracing::info!(
                    task = %task.context_key(),
                    timeout_ms = config.handoff_timeout.as_millis() as u64,
                    "Handing off long-running task"
                );
                let finalizer = Arc::new(AsyncActions::new(
                    task.clone(),
                    actions.clone(),
                    self.store.clone(),
                    self.scheduler.clone(),
                ));
                let abort = execution.abort_handle();
                let completion = {
                    let finalizer = finalizer.clone();
                    let actions = actions.clone();
                    let task = task.clone();
                    tokio::spawn(async move {
                        let joined = execution.await;
                        if matches!(&joined, Err(e) if e.is_cancelled()) {
                            return Err(FinalizeError::Aborted { key: task.context_key() });
                        }
                        if let Err(e) = flatten(joined) {
                            actions.fail_if_pending(&task, &e.to_string());
                        }
                        finalizer.on_completed().await
                    })
                };
                Some(AsyncTask {
                    task,
                    started_at,
                    completion,
                    finalizer,
                    execution: abort,
                })
            }
        }
    }

    async fn emit_started(&self, tasks: &[Task]) {
        if self.events.is_empty() {
            return;
        }
        let events = tasks
            .iter()
            .map(|task| LifecycleEvent::TaskStarted { task: task.clone() })
            .collect();
        self.events.emit_all(events).await;
    }

    async fn emit_outcome(&self, actions: &Actions, task: &Task) {
        if self.events.is_empty() {
            return;
        }
        let key = task.context_key();
        let event = match actions.task_result_status(&key) {
            TaskResultStatus::Succeeded => LifecycleEvent::TaskCompleted { task: task.clone() },
            TaskResultStatus::Failed => {
                let error = actions
                    .task_result(&key)
                    .and_then(|r| r.failed_tasks.into_iter().next())
                    .and_then(|t| t.execution_stats.last_error);
                LifecycleEvent::TaskFailed {
                    task: task.clone(),
                    error,
                }
            }
            TaskResultStatus::Pending => return,
        };
        self.events.emit(event).await;
    }
}

/// Group tasks by type, keeping first-seen order of types and tasks.
fn group_by_type(tasks: Vec<Task>) -> Vec<(String, Vec<Task>)> {
    let mut groups: Vec<(String, Vec<Task>)> = Vec::new();
    for task in tasks {
        match groups.iter_mut().find(|(task_type, _)| *task_type == task.task_type) {
            Some((_, group)) => group.push(task),
            None => groups.push((task.task_type.clone(), vec![task])),
        }
    }
    groups
}

/// Await an executor call, turning a panic into [`ExecutorError::Panicked`].
async fn guarded<F>(call: F) -> Result<(), ExecutorError>
where
    F: Future<Output = Result<(), ExecutorError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(ExecutorError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn flatten(joined: Result<Result<(), ExecutorError>, tokio::task::JoinError>) -> Result<(), ExecutorError> {
    joined.unwrap_or_else(|e| Err(ExecutorError::Panicked(e.to_string())))
}
