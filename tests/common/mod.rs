//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskloom::backend::{MemoryCache, MemoryTaskStore, MemoryTransport};
use taskloom::{
    Actions, AsyncTaskManager, EventSink, Executor, ExecutorError, ExecutorOptions, ExecutorRegistry,
    LifecycleEvent, QueueNamer, Recorder, Task, TaskActions, TaskHandlerBuilder, TaskRunner, TaskScheduler,
};
use tokio::sync::Mutex;

pub const QUEUE: &str = "jobs";

pub fn task(task_type: &str, id: &str) -> Task {
    Task::new(QUEUE, task_type, serde_json::json!({ "id": id })).with_id(id)
}

/// Records every lifecycle event it sees.
#[derive(Clone, Default)]
pub struct CollectingRecorder {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl CollectingRecorder {
    pub async fn names(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(LifecycleEvent::name).collect()
    }

    pub async fn count(&self, name: &str) -> usize {
        self.names().await.into_iter().filter(|n| *n == name).count()
    }

    pub async fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Recorder for CollectingRecorder {
    async fn record(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// In-memory collaborators shared by one or more handlers.
#[derive(Clone)]
pub struct Harness {
    pub store: Arc<MemoryTaskStore>,
    pub transport: Arc<MemoryTransport>,
    pub cache: Arc<MemoryCache>,
    pub recorder: CollectingRecorder,
}

impl Harness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        Self {
            store: Arc::new(MemoryTaskStore::new()),
            transport: Arc::new(MemoryTransport::new().with_poll_interval(Duration::from_millis(10))),
            cache: Arc::new(MemoryCache::new()),
            recorder: CollectingRecorder::default(),
        }
    }

    pub fn builder(&self) -> TaskHandlerBuilder {
        TaskHandlerBuilder::new(self.store.clone(), self.transport.clone(), self.cache.clone())
            .recorder(self.recorder.clone())
    }

    /// A bare orchestrator with one executor registered for `task_type`.
    pub async fn runner(
        &self,
        task_type: &str,
        executor: Arc<dyn Executor>,
        options: ExecutorOptions,
        async_manager: Option<Arc<dyn AsyncTaskManager>>,
    ) -> TaskRunner {
        let registry = Arc::new(ExecutorRegistry::new(QueueNamer::default(), self.transport.clone()));
        registry.register(QUEUE, task_type, executor, options).await.unwrap();
        let recorder: Arc<dyn Recorder> = Arc::new(self.recorder.clone());
        let events = EventSink::new(vec![recorder]);
        let scheduler = TaskScheduler::new(
            registry.clone(),
            self.store.clone(),
            self.transport.clone(),
            events.clone(),
            Duration::from_secs(120),
        );
        TaskRunner::new(
            registry,
            self.store.clone(),
            self.cache.clone(),
            scheduler,
            async_manager,
            events,
            Duration::from_secs(60),
            Duration::from_secs(180),
        )
    }
}

/// Succeeds every task, optionally after a delay.
#[derive(Clone, Default)]
pub struct Succeed {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl Succeed {
    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for Succeed {
    async fn execute(&self, _task: Task, actions: TaskActions) -> Result<(), ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        actions.success()?;
        Ok(())
    }
}

/// Records a failure for every task.
pub struct AlwaysFail;

#[async_trait]
impl Executor for AlwaysFail {
    async fn execute(&self, _task: Task, actions: TaskActions) -> Result<(), ExecutorError> {
        actions.fail("boom")?;
        Ok(())
    }
}

/// Returns an error without recording anything.
pub struct Explodes;

#[async_trait]
impl Executor for Explodes {
    async fn execute(&self, _task: Task, _actions: TaskActions) -> Result<(), ExecutorError> {
        Err(ExecutorError::msg("exploded"))
    }
}

/// Panics mid-execution.
pub struct Panics;

#[async_trait]
impl Executor for Panics {
    async fn execute(&self, _task: Task, _actions: TaskActions) -> Result<(), ExecutorError> {
        panic!("executor bug");
    }
}

/// Finishes without recording an outcome, optionally after a delay.
#[derive(Default)]
pub struct Silent {
    pub delay: Duration,
}

#[async_trait]
impl Executor for Silent {
    async fn execute(&self, _task: Task, _actions: TaskActions) -> Result<(), ExecutorError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Resolves the first task of a group, then gives up on the rest.
pub struct PartialBatch;

#[async_trait]
impl Executor for PartialBatch {
    async fn execute(&self, _task: Task, actions: TaskActions) -> Result<(), ExecutorError> {
        actions.success()?;
        Ok(())
    }

    async fn execute_multiple(&self, tasks: Vec<Task>, actions: Actions) -> Result<(), ExecutorError> {
        if let Some(first) = tasks.first() {
            actions.success(first)?;
        }
        Err(ExecutorError::msg("partial batch"))
    }
}

/// Tracks how many executions overlap.
#[derive(Clone, Default)]
pub struct ConcurrencyTracker {
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Executor for ConcurrencyTracker {
    async fn execute(&self, _task: Task, actions: TaskActions) -> Result<(), ExecutorError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        actions.success()?;
        Ok(())
    }
}

/// Succeeds and queues one follow-up task.
pub struct Spawner;

#[async_trait]
impl Executor for Spawner {
    async fn execute(&self, task: Task, actions: TaskActions) -> Result<(), ExecutorError> {
        actions.add_tasks(vec![Task::new(&task.queue_id, "follow_up", serde_json::json!({}))]);
        actions.success()?;
        Ok(())
    }
}
