//! # Taskloom
//!
//! A distributed task-queue execution engine.
//!
//! Workers pull batches of tasks from a message queue, take a per-task lock so
//! only one worker runs any task at a time, dispatch each task to the executor
//! registered for its (queue, type) and reconcile the outcome with durable
//! storage: retries with quadratic backoff, failures, new follow-up tasks and
//! ignored tasks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskloom::{ExecutorOptions, TaskHandlerBuilder};
//! use taskloom::backend::{MemoryCache, MemoryTaskStore, MemoryTransport};
//!
//! let handler = TaskHandlerBuilder::new(store, transport, cache)
//!     .executor("emails", "send", SendEmail, ExecutorOptions::new().parallel(20))
//!     .executor("reports", "render", RenderReport, ExecutorOptions::new().async_handoff(Duration::from_secs(30)))
//!     .async_manager(AsyncTaskPool::new(16))
//!     .recorder(MyRecorder)
//!     .build()
//!     .await?;
//!
//! handler.run(&["emails", "reports"], cancel).await?;
//! ```
//!
//! ## Executors
//!
//! Executors report outcomes through the accumulator they are handed:
//!
//! ```rust,ignore
//! #[async_trait]
//! impl Executor for SendEmail {
//!     async fn execute(&self, task: Task, actions: TaskActions) -> Result<(), ExecutorError> {
//!         match deliver(&task.payload).await {
//!             Ok(()) => actions.success()?,
//!             Err(e) => actions.fail(e.to_string())?,
//!         }
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Returning `Err` (or panicking) fails every task the executor left
//! unresolved; a task with neither outcome is recorded as ignored.
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed task store

pub mod actions;
pub mod backend;
pub mod config;
pub mod executor;
pub mod handler;
pub mod recorder;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod task;

pub use actions::{ActionError, ActionResults, Actions, AsyncActions, FinalizeError, TaskActions, TaskResultStatus};
pub use backend::{AsyncTaskManager, BackendError, CacheBackend, TaskStore, Transport};
pub use config::HandlerConfig;
pub use executor::{AsyncConfig, Executor, ExecutorError, ExecutorOptions};
pub use handler::{HandlerError, PostProcessInput, PostProcessSummary, TaskHandler, TaskHandlerBuilder, TaskScheduler};
pub use recorder::{EventSink, LifecycleEvent, NoopRecorder, Recorder};
pub use registry::{ExecutorRegistry, QueueNamer};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{AsyncTask, AsyncTaskPool, RunError, RunResult, TaskRunner};
pub use task::{ExecutionStats, Task, TaskId, TaskStatus};

#[cfg(feature = "sqlite")]
pub use backend::SqliteTaskStore;
