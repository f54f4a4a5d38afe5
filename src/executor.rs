//! Executor trait, dispatch options and error types.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::actions::{ActionError, Actions, TaskActions};
use crate::task::Task;

/// Error returned by an executor call.
///
/// Never fatal for a run: the orchestrator converts it into a `fail` for
/// every task the executor left unresolved.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The executor gave up on its input.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// The executor panicked while running.
    #[error("executor panicked: {0}")]
    Panicked(String),
}

impl ExecutorError {
    /// Create a failure from any error.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }

    /// Create a failure from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::Error::msg(message))
    }
}

impl From<ActionError> for ExecutorError {
    fn from(err: ActionError) -> Self {
        Self::Failed(err.into())
    }
}

/// Code registered for one (queue, task type).
///
/// Executors record outcomes through the accumulator they are handed rather
/// than through their return value. Returning `Err` is only a fallback: any
/// task still pending afterwards is failed with the error's message.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Process one task. Call `actions.success()` or `actions.fail()` exactly once.
    async fn execute(&self, task: Task, actions: TaskActions) -> Result<(), ExecutorError>;

    /// Process a whole same-type group; used when the executor is registered
    /// with [`ExecutorOptions::multiple`]. Must call `actions.success(task)` or
    /// `actions.fail(task, ..)` once per task it handled.
    ///
    /// The default runs [`Executor::execute`] for each task in order.
    async fn execute_multiple(&self, tasks: Vec<Task>, actions: Actions) -> Result<(), ExecutorError> {
        for task in tasks {
            let handle = actions.fork_for_task(&task);
            self.execute(task, handle).await?;
        }
        Ok(())
    }
}

/// Async handoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncConfig {
    /// How long a task may run synchronously before it is handed off.
    pub handoff_timeout: Duration,
}

/// How a registered executor is dispatched and retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Receive every same-type task of a batch in one call.
    pub multiple: bool,
    /// Fan tasks out concurrently, `chunk_size` at a time.
    pub parallel: bool,
    pub chunk_size: usize,
    /// Only persist happy-path tasks when they fail, retry or get ignored.
    pub store_on_failure: bool,
    pub default_retries: u32,
    pub async_config: Option<AsyncConfig>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            multiple: false,
            parallel: false,
            chunk_size: 10,
            store_on_failure: false,
            default_retries: 3,
            async_config: None,
        }
    }
}

impl ExecutorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    /// Dispatch concurrently in chunks.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is 0.
    pub fn parallel(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "parallel chunk size must be at least 1");
        self.parallel = true;
        self.chunk_size = chunk_size;
        self
    }

    pub fn store_on_failure(mut self) -> Self {
        self.store_on_failure = true;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn async_handoff(mut self, handoff_timeout: Duration) -> Self {
        self.async_config = Some(AsyncConfig { handoff_timeout });
        self
    }
}
