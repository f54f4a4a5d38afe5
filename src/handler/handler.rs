//! The worker-facing task handler.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::discard::DiscardTracker;
use super::promoter::MaturePromoter;
use super::schedule::TaskScheduler;
use super::stats::{BatchCounts, QueueStats, WorkerInfo, WorkerMonitor, WorkerStatsSnapshot};
use super::HandlerError;
use crate::backend::{AsyncTaskManager, BatchHandler, CacheBackend, TaskStore, Transport};
use crate::config::HandlerConfig;
use crate::executor::{Executor, ExecutorOptions};
use crate::recorder::{EventSink, LifecycleEvent};
use crate::registry::ExecutorRegistry;
use crate::retry::RetryDecision;
use crate::runner::{AsyncTask, RunResult, TaskRunner};
use crate::task::{Task, TaskStatus};

/// Harvested tasks to reconcile with durable storage.
#[derive(Debug, Clone, Default)]
pub struct PostProcessInput {
    pub failed: Vec<Task>,
    pub new: Vec<Task>,
    pub success: Vec<Task>,
}

/// What [`TaskHandler::post_process_tasks`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostProcessSummary {
    pub retried: usize,
    /// Persisted tasks marked failed after their last attempt.
    pub failed: usize,
    /// Never-persisted tasks dropped after their last attempt.
    pub discarded: usize,
    pub executed: usize,
    pub new_tasks: usize,
}

/// Outcome of one consumed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub size: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub ignored: usize,
    pub handed_off: usize,
    pub deferred: usize,
    pub retried: usize,
    pub discarded: usize,
}

struct Inner {
    config: HandlerConfig,
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn Transport>,
    async_manager: Option<Arc<dyn AsyncTaskManager>>,
    scheduler: TaskScheduler,
    runner: TaskRunner,
    promoter: MaturePromoter,
    discards: DiscardTracker,
    events: EventSink,
    queue_stats: Mutex<HashMap<String, QueueStats>>,
    monitor: WorkerMonitor,
}

/// Consumes queues, runs batches and reconciles their outcome.
///
/// Cheap to clone; clones share every collaborator and counter.
#[derive(Clone)]
pub struct TaskHandler {
    inner: Arc<Inner>,
}

impl TaskHandler {
    pub(super) fn assemble(
        config: HandlerConfig,
        registry: Arc<ExecutorRegistry>,
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn CacheBackend>,
        async_manager: Option<Arc<dyn AsyncTaskManager>>,
        events: EventSink,
    ) -> Self {
        let scheduler = TaskScheduler::new(
            registry.clone(),
            store.clone(),
            transport.clone(),
            events.clone(),
            config.immediate_window,
        );
        let runner = TaskRunner::new(
            registry.clone(),
            store.clone(),
            cache.clone(),
            scheduler.clone(),
            async_manager.clone(),
            events.clone(),
            config.task_lock_ttl,
            config.backpressure_delay,
        );
        let promoter = MaturePromoter::new(
            store.clone(),
            cache.clone(),
            scheduler.clone(),
            config.promotion_lock_ttl,
            config.dedup_ttl,
        );
        let discards = DiscardTracker::new(cache, config.discard_sample_rate);

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                transport,
                async_manager,
                scheduler,
                runner,
                promoter,
                discards,
                events,
                queue_stats: Mutex::new(HashMap::new()),
                monitor: WorkerMonitor::new(WorkerInfo::current()),
            }),
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.inner.config
    }

    pub fn worker(&self) -> &WorkerInfo {
        self.inner.monitor.info()
    }

    pub fn worker_stats(&self) -> WorkerStatsSnapshot {
        self.inner.monitor.snapshot()
    }

    /// Register an executor after the handler was built.
    pub async fn register_executor(
        &self,
        queue: &str,
        task_type: &str,
        executor: Arc<dyn Executor>,
        options: ExecutorOptions,
    ) -> Result<(), HandlerError> {
        self.inner.registry.register(queue, task_type, executor, options).await?;
        Ok(())
    }

    /// Schedule tasks: near-term ones go to the transport, later ones to the
    /// scheduled store.
    pub async fn add_tasks(&self, tasks: Vec<Task>) -> Result<(), HandlerError> {
        self.inner.scheduler.add_tasks(tasks).await?;
        Ok(())
    }

    /// Persist retries, exhausted failures, successes and new tasks.
    pub async fn post_process_tasks(&self, input: PostProcessInput) -> Result<PostProcessSummary, HandlerError> {
        let inner = &self.inner;
        let now = Utc::now();
        let mut summary = PostProcessSummary::default();

        let mut upserts = Vec::new();
        let mut reschedule = Vec::new();
        let mut discarded: HashMap<String, Vec<Task>> = HashMap::new();
        let mut retried_by_queue: HashMap<String, u64> = HashMap::new();

        for mut task in input.failed {
            let options = inner.registry.get_options(&task.queue_id, &task.task_type);
            let default_retries = options
                .as_ref()
                .map(|o| o.default_retries)
                .unwrap_or(inner.config.default_retries);
            let store_on_failure = options.map(|o| o.store_on_failure).unwrap_or(false);

            match inner.config.retry.decide(&task, default_retries) {
                RetryDecision::Retry { retry_count, delay } => {
                    task.status = TaskStatus::Scheduled;
                    task.execution_stats.retry_count = retry_count;
                    task.execute_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    task.processing_started_at = None;
                    debug!(
                        task = %task.context_key(),
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling retry"
                    );

                    *retried_by_queue.entry(self.queue_name(&task.queue_id)).or_default() += 1;
                    summary.retried += 1;
                    if task.id.is_some() {
                        upserts.push(task);
                    } else if store_on_failure {
                        task.ensure_id(|| inner.store.generate_id());
                        upserts.push(task);
                    } else {
                        reschedule.push(task);
                    }
                }
                RetryDecision::Exhausted => {
                    if task.id.is_some() {
                        task.status = TaskStatus::Failed;
                        summary.failed += 1;
                        upserts.push(task);
                    } else {
                        discarded.entry(self.queue_name(&task.queue_id)).or_default().push(task);
                    }
                }
            }
        }

        if !upserts.is_empty() {
            inner.store.upsert_tasks(upserts).await?;
        }
        if !reschedule.is_empty() {
            inner.scheduler.add_tasks(reschedule).await?;
        }

        for (queue, tasks) in discarded {
            summary.discarded += tasks.len();
            self.discard(&queue, tasks, now).await;
        }

        let executed: Vec<Task> = input.success.into_iter().filter(|t| t.id.is_some()).collect();
        if !executed.is_empty() {
            inner.store.mark_tasks_as_executed(&executed).await?;
            summary.executed = executed.len();
        }

        if !input.new.is_empty() {
            summary.new_tasks = input.new.len();
            inner.scheduler.add_tasks(input.new).await?;
        }

        if !retried_by_queue.is_empty() {
            let mut stats = inner.queue_stats.lock();
            for (queue, count) in retried_by_queue {
                self.stats_entry(&mut stats, &queue).record_retries(count);
            }
        }

        Ok(summary)
    }

    async fn discard(&self, queue: &str, tasks: Vec<Task>, now: chrono::DateTime<Utc>) {
        let inner = &self.inner;
        let count = tasks.len() as u64;
        warn!(queue, count, "Discarding tasks that ran out of retries");

        let last_24h = match inner.discards.record(queue, count, now).await {
            Ok(total) => total,
            Err(e) => {
                warn!(queue, error = %e, "Failed to record discard counter");
                None
            }
        };

        {
            let mut stats = inner.queue_stats.lock();
            self.stats_entry(&mut stats, queue).record_discards(count);
        }

        if !inner.events.is_empty() {
            let exhausted = tasks
                .into_iter()
                .map(|task| {
                    let error = task.execution_stats.last_error.clone();
                    LifecycleEvent::TaskExhausted { task, error }
                })
                .collect();
            inner.events.emit_all(exhausted).await;
        }
        inner
            .events
            .emit(LifecycleEvent::TasksDiscarded {
                queue: queue.to_string(),
                count,
                last_24h,
            })
            .await;
    }

    /// Run one delivered batch end to end.
    pub async fn process_batch(
        &self,
        queue: &str,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, HandlerError> {
        let inner = &self.inner;
        let queue = self.queue_name(queue);
        let size = tasks.len();

        if cancel.is_cancelled() {
            debug!(queue = %queue, size, "Shutting down; returning batch to transport");
            inner.transport.add_messages(&queue, tasks).await?;
            return Ok(BatchSummary::default());
        }

        let started = Instant::now();
        inner
            .events
            .emit(LifecycleEvent::BatchStarted {
                queue: queue.clone(),
                size,
            })
            .await;

        let RunResult {
            outcome,
            async_tasks,
            deferred,
            undelivered,
        } = inner.runner.run(&queue, tasks, cancel).await?;

        let handed_off = async_tasks.len();
        if handed_off > 0 {
            self.hand_off(&queue, async_tasks).await?;
        }

        let ignored = self.persist_ignored(outcome.ignored_tasks).await?;
        let succeeded = outcome.success_tasks.len();
        let failed = outcome.failed_tasks.len();

        let post = self
            .post_process_tasks(PostProcessInput {
                failed: outcome.failed_tasks,
                new: outcome.new_tasks,
                success: outcome.success_tasks,
            })
            .await?;

        if !undelivered.is_empty() {
            inner.transport.add_messages(&queue, undelivered).await?;
        }

        let counts = BatchCounts {
            processed: (succeeded + failed + ignored + handed_off) as u64,
            succeeded: succeeded as u64,
            failed: failed as u64,
            ignored: ignored as u64,
            handed_off: handed_off as u64,
        };
        let duration = started.elapsed();
        {
            let mut stats = inner.queue_stats.lock();
            self.stats_entry(&mut stats, &queue).record_batch(counts);
        }
        inner.monitor.record_batch(counts, duration);
        self.flush_stats(false).await;

        inner
            .events
            .emit(LifecycleEvent::BatchCompleted {
                queue: queue.clone(),
                size,
                succeeded,
                failed,
                ignored,
                handed_off,
                duration,
            })
            .await;

        debug!(
            queue = %queue,
            size,
            succeeded,
            failed,
            ignored,
            handed_off,
            deferred,
            elapsed_ms = duration.as_millis() as u64,
            "Processed batch"
        );

        Ok(BatchSummary {
            size,
            succeeded,
            failed,
            ignored,
            handed_off,
            deferred,
            retried: post.retried,
            discarded: post.discarded,
        })
    }

    async fn hand_off(&self, queue: &str, async_tasks: Vec<AsyncTask>) -> Result<(), HandlerError> {
        let inner = &self.inner;
        let Some(manager) = &inner.async_manager else {
            error!(queue, count = async_tasks.len(), "Tasks handed off without an async task manager");
            return Err(HandlerError::AsyncManagerMissing {
                queue: queue.to_string(),
                count: async_tasks.len(),
            });
        };

        let retry_at =
            Utc::now() + chrono::Duration::from_std(inner.config.handoff_rejected_delay).unwrap_or_else(|_| chrono::Duration::zero());
        let mut requeue = Vec::new();
        for async_task in async_tasks {
            if let Err(rejected) = manager.handoff_task(async_task).await {
                let key = rejected.task.context_key();
                let Some(mut task) = rejected.cancel().await else {
                    debug!(queue, task = %key, "Async manager rejected a task that already finished");
                    continue;
                };
                warn!(queue, task = %key, "Async manager rejected task; requeueing");
                task.status = TaskStatus::Scheduled;
                task.execute_at = retry_at;
                task.processing_started_at = None;
                requeue.push(task);
            }
        }
        if !requeue.is_empty() {
            inner.store.upsert_tasks(requeue).await?;
        }
        Ok(())
    }

    async fn persist_ignored(&self, mut tasks: Vec<Task>) -> Result<usize, HandlerError> {
        if tasks.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        for task in &mut tasks {
            task.ensure_id(|| self.inner.store.generate_id());
            task.status = TaskStatus::Ignored;
            task.execution_stats.ignored_at.get_or_insert(now);
            task.execution_stats
                .ignored_reason
                .get_or_insert_with(|| "executor recorded no outcome".to_string());
        }
        let count = tasks.len();
        self.inner.store.upsert_tasks(tasks).await?;
        Ok(count)
    }

    fn batch_handler(
        &self,
        queue: &str,
        cancel: CancellationToken,
        failure: Arc<Mutex<Option<HandlerError>>>,
    ) -> BatchHandler {
        let handler = self.clone();
        let queue = queue.to_string();
        Arc::new(move |tasks: Vec<Task>| {
            let handler = handler.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            let failure = failure.clone();
            async move {
                match handler.process_batch(&queue, tasks, &cancel).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Batch processing failed");
                        let message = e.to_string();
                        *failure.lock() = Some(e);
                        Err(anyhow::anyhow!(message))
                    }
                }
            }
            .boxed()
        })
    }

    /// Consume `queue` until `cancel` fires or a batch fails.
    pub async fn start_consuming_tasks(&self, queue: &str, cancel: CancellationToken) -> Result<(), HandlerError> {
        let queue = self.queue_name(queue);
        info!(queue = %queue, "Starting consumer");

        let failure = Arc::new(Mutex::new(None));
        let handler = self.batch_handler(&queue, cancel.clone(), failure.clone());
        let result = self
            .inner
            .transport
            .consume_messages_stream(&queue, handler, cancel)
            .await;

        info!(queue = %queue, "Consumer stopped");
        if let Some(e) = failure.lock().take() {
            return Err(e);
        }
        result.map_err(HandlerError::from)
    }

    /// Consume at most one batch of up to `limit` tasks. Returns how many
    /// tasks were delivered.
    pub async fn consume_batch(
        &self,
        queue: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, HandlerError> {
        let queue = self.queue_name(queue);
        let failure = Arc::new(Mutex::new(None));
        let handler = self.batch_handler(&queue, cancel.clone(), failure.clone());
        let result = self
            .inner
            .transport
            .consume_messages_batch(&queue, handler, limit)
            .await;
        if let Some(e) = failure.lock().take() {
            return Err(e);
        }
        Ok(result?)
    }

    /// One promotion pass over the scheduled store.
    pub async fn promote_mature_tasks(&self) -> Result<usize, HandlerError> {
        Ok(self.inner.promoter.promote_once().await?)
    }

    /// Promote mature tasks every interval until cancelled, then flush stats.
    pub async fn start_mature_task_promotion(&self, cancel: CancellationToken) {
        let every = self.inner.config.promotion_interval;
        info!(interval_ms = every.as_millis() as u64, "Starting mature task promotion");

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.promote_mature_tasks().await {
                        error!(error = %e, "Mature task promotion failed");
                    }
                }
            }
        }

        self.flush_stats(true).await;
        info!("Stopped mature task promotion");
    }

    async fn heartbeat(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.inner.config.heartbeat_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.inner.monitor.snapshot();
                    debug!(
                        worker = %self.worker().id,
                        processed = stats.processed,
                        avg_batch_ms = stats.avg_batch_ms,
                        "Heartbeat"
                    );
                    self.inner
                        .events
                        .emit(LifecycleEvent::WorkerHeartbeat {
                            worker: self.worker().clone(),
                            stats,
                        })
                        .await;
                }
            }
        }
    }

    /// Run a worker: one consumer per queue, the promotion loop and the
    /// heartbeat, until `cancel` fires or a consumer fails.
    pub async fn run(&self, queues: &[&str], cancel: CancellationToken) -> Result<(), HandlerError> {
        let worker = self.worker().clone();
        info!(worker = %worker.id, queues = ?queues, "Worker starting");
        self.inner
            .events
            .emit(LifecycleEvent::WorkerStarted { worker: worker.clone() })
            .await;

        let shutdown = cancel.child_token();
        let consumers = queues.iter().map(|queue| {
            let shutdown = shutdown.clone();
            async move {
                let result = self.start_consuming_tasks(queue, shutdown.clone()).await;
                if let Err(e) = &result {
                    error!(queue = %queue, error = %e, "Consumer failed; stopping worker");
                    shutdown.cancel();
                }
                result
            }
        });

        let (results, (), ()) = tokio::join!(
            futures::future::join_all(consumers),
            self.start_mature_task_promotion(shutdown.clone()),
            self.heartbeat(shutdown.clone()),
        );

        self.flush_stats(true).await;
        let stats = self.inner.monitor.snapshot();
        info!(worker = %worker.id, processed = stats.processed, "Worker stopped");
        self.inner
            .events
            .emit(LifecycleEvent::WorkerStopped { worker, stats })
            .await;

        results.into_iter().collect::<Result<Vec<()>, _>>().map(|_| ())
    }

    /// Emit per-queue counters that crossed a threshold, or all of them when
    /// `force` is set.
    pub async fn flush_stats(&self, force: bool) {
        let flushed: Vec<_> = {
            let mut stats = self.inner.queue_stats.lock();
            stats
                .iter_mut()
                .filter(|(_, s)| !s.current().is_empty() && (force || s.should_flush()))
                .map(|(queue, s)| (queue.clone(), s.take()))
                .collect()
        };

        for (queue, stats) in flushed {
            info!(
                queue = %queue,
                processed = stats.processed,
                succeeded = stats.succeeded,
                failed = stats.failed,
                retried = stats.retried,
                discarded = stats.discarded,
                "Queue stats"
            );
            self.inner
                .events
                .emit(LifecycleEvent::QueueStats { queue, stats })
                .await;
        }
    }

    fn queue_name(&self, queue: &str) -> String {
        self.inner.registry.namer().normalize(queue)
    }

    fn stats_entry<'a>(&self, stats: &'a mut HashMap<String, QueueStats>, queue: &str) -> &'a mut QueueStats {
        let config = &self.inner.config;
        stats
            .entry(queue.to_string())
            .or_insert_with(|| QueueStats::new(config.flush_processed_threshold, config.flush_failed_threshold))
    }
}
