//! Executor registry.
//!
//! Maps (queue, task type) to the executor and options that handle it. Queue
//! names are environment-qualified through [`QueueNamer`] on every access so
//! registration and lookup always agree.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackendError, Transport};
use crate::executor::{Executor, ExecutorOptions};

/// Qualifies queue names with the deployment environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueNamer {
    environment: Option<String>,
}

impl QueueNamer {
    pub fn new(environment: Option<String>) -> Self {
        Self {
            environment: environment.filter(|env| !env.is_empty()),
        }
    }

    /// Returns `queue-<env>`; already-qualified names pass through unchanged.
    pub fn normalize(&self, queue: &str) -> String {
        match &self.environment {
            Some(env) => {
                let suffix = format!("-{env}");
                if queue.ends_with(&suffix) {
                    queue.to_string()
                } else {
                    format!("{queue}{suffix}")
                }
            }
            None => queue.to_string(),
        }
    }
}

/// An executor together with its dispatch options.
#[derive(Clone)]
pub struct RegisteredExecutor {
    pub executor: Arc<dyn Executor>,
    pub options: ExecutorOptions,
}

impl std::fmt::Debug for RegisteredExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredExecutor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Process-lifetime registry of executors.
pub struct ExecutorRegistry {
    namer: QueueNamer,
    transport: Arc<dyn Transport>,
    executors: RwLock<HashMap<String, HashMap<String, RegisteredExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new(namer: QueueNamer, transport: Arc<dyn Transport>) -> Self {
        Self {
            namer,
            transport,
            executors: RwLock::new(HashMap::new()),
        }
    }

    pub fn namer(&self) -> &QueueNamer {
        &self.namer
    }

    /// Register an executor; the last registration for a (queue, type) wins.
    ///
    /// Also registers the queue with the transport.
    pub async fn register(
        &self,
        queue: &str,
        task_type: &str,
        executor: Arc<dyn Executor>,
        options: ExecutorOptions,
    ) -> Result<(), BackendError> {
        let queue = self.namer.normalize(queue);
        self.transport.register(&queue).await?;

        let replaced = self
            .executors
            .write()
            .entry(queue.clone())
            .or_default()
            .insert(task_type.to_string(), RegisteredExecutor { executor, options })
            .is_some();

        tracing::info!(queue = %queue, task_type, replaced, "Registered executor");
        Ok(())
    }

    /// Look up the executor for a task type. `None` means the type is ignored.
    pub fn get_executor(&self, queue: &str, task_type: &str) -> Option<RegisteredExecutor> {
        let queue = self.namer.normalize(queue);
        self.executors
            .read()
            .get(&queue)
            .and_then(|types| types.get(task_type))
            .cloned()
    }

    /// Options for a task type, if registered.
    pub fn get_options(&self, queue: &str, task_type: &str) -> Option<ExecutorOptions> {
        self.get_executor(queue, task_type).map(|r| r.options)
    }

    pub fn get_task_types_for_queue(&self, queue: &str) -> Vec<String> {
        let queue = self.namer.normalize(queue);
        let mut types: Vec<String> = self
            .executors
            .read()
            .get(&queue)
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    pub fn get_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.executors.read().keys().cloned().collect();
        queues.sort();
        queues
    }
}
