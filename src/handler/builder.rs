//! Builder for [`TaskHandler`].

use std::sync::Arc;

use super::handler::TaskHandler;
use super::HandlerError;
use crate::backend::{AsyncTaskManager, CacheBackend, TaskStore, Transport};
use crate::config::HandlerConfig;
use crate::executor::{Executor, ExecutorOptions};
use crate::recorder::{EventSink, Recorder};
use crate::registry::{ExecutorRegistry, QueueNamer};

struct PendingExecutor {
    queue: String,
    task_type: String,
    executor: Arc<dyn Executor>,
    options: ExecutorOptions,
}

/// Builder for constructing a TaskHandler.
pub struct TaskHandlerBuilder {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheBackend>,
    config: HandlerConfig,
    executors: Vec<PendingExecutor>,
    recorders: Vec<Arc<dyn Recorder>>,
    async_manager: Option<Arc<dyn AsyncTaskManager>>,
}

impl TaskHandlerBuilder {
    /// Create a new builder over the three shared collaborators.
    pub fn new(store: Arc<dyn TaskStore>, transport: Arc<dyn Transport>, cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            store,
            transport,
            cache,
            config: HandlerConfig::default(),
            executors: Vec::new(),
            recorders: Vec::new(),
            async_manager: None,
        }
    }

    pub fn config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an executor for a (queue, task type).
    pub fn executor(
        mut self,
        queue: &str,
        task_type: &str,
        executor: impl Executor + 'static,
        options: ExecutorOptions,
    ) -> Self {
        self.executors.push(PendingExecutor {
            queue: queue.to_string(),
            task_type: task_type.to_string(),
            executor: Arc::new(executor),
            options,
        });
        self
    }

    /// Add a lifecycle event recorder.
    pub fn recorder(mut self, recorder: impl Recorder + 'static) -> Self {
        self.recorders.push(Arc::new(recorder));
        self
    }

    /// Set the owner of tasks that outlive their handoff timeout.
    pub fn async_manager(mut self, manager: impl AsyncTaskManager + 'static) -> Self {
        self.async_manager = Some(Arc::new(manager));
        self
    }

    /// Build the handler, registering every executor's queue with the
    /// transport.
    pub async fn build(self) -> Result<TaskHandler, HandlerError> {
        let namer = QueueNamer::new(self.config.environment.clone());
        let registry = Arc::new(ExecutorRegistry::new(namer, self.transport.clone()));
        for pending in self.executors {
            registry
                .register(&pending.queue, &pending.task_type, pending.executor, pending.options)
                .await?;
        }

        Ok(TaskHandler::assemble(
            self.config,
            registry,
            self.store,
            self.transport,
            self.cache,
            self.async_manager,
            EventSink::new(self.recorders),
        ))
    }
}
