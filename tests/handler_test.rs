//! Integration tests for durable reconciliation.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use taskloom::backend::{CacheBackend, MemoryTaskStore, TaskStore};
use taskloom::handler::promoter::PROMOTION_LOCK_KEY;
use taskloom::{
    AsyncTask, AsyncTaskManager, AsyncTaskPool, BackendError, ExecutorOptions, HandlerConfig, HandlerError,
    LifecycleEvent, PostProcessInput, Task, TaskId, TaskStatus,
};
use tokio_util::sync::CancellationToken;

// Accepts nothing.
struct RejectingManager;

#[async_trait]
impl AsyncTaskManager for RejectingManager {
    fn can_accept_task(&self) -> bool {
        true
    }

    async fn handoff_task(&self, task: AsyncTask) -> Result<(), AsyncTask> {
        Err(task)
    }
}

// Memory store whose upserts always fail.
struct UpsertFails(Arc<MemoryTaskStore>);

#[async_trait]
impl TaskStore for UpsertFails {
    async fn add_tasks_to_scheduled(&self, tasks: Vec<Task>) -> Result<Vec<Task>, BackendError> {
        self.0.add_tasks_to_scheduled(tasks).await
    }

    async fn get_mature_tasks(&self, now: chrono::DateTime<Utc>) -> Result<Vec<Task>, BackendError> {
        self.0.get_mature_tasks(now).await
    }

    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> Result<(), BackendError> {
        self.0.mark_tasks_as_executed(tasks).await
    }

    async fn upsert_tasks(&self, _tasks: Vec<Task>) -> Result<(), BackendError> {
        Err(BackendError::Storage("disk full".to_string()))
    }

    async fn get_tasks_by_ids(&self, ids: &[TaskId]) -> Result<Vec<Task>, BackendError> {
        self.0.get_tasks_by_ids(ids).await
    }
}

fn due_in(task: Task, secs: i64) -> Task {
    task.execute_at(Utc::now() + chrono::Duration::seconds(secs))
}

#[tokio::test]
async fn test_add_tasks_routes_by_due_time() {
    let harness = Harness::new();
    let handler = harness.builder().build().await.unwrap();

    handler
        .add_tasks(vec![
            due_in(Task::new(QUEUE, "later", serde_json::json!({})), 600),
            due_in(Task::new(QUEUE, "soon", serde_json::json!({})), 30),
        ])
        .await
        .unwrap();

    let stored = harness.store.snapshot();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].task_type, "later");
    assert!(stored[0].id.is_some());

    let queued = harness.transport.pending(QUEUE);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].task_type, "soon");
    assert!(queued[0].id.is_none());

    assert_eq!(harness.recorder.count("task_scheduled").await, 2);
}

#[tokio::test]
async fn test_immediate_task_gets_id_when_store_on_failure() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .executor(QUEUE, "work", Succeed::default(), ExecutorOptions::new().store_on_failure())
        .build()
        .await
        .unwrap();

    handler
        .add_tasks(vec![Task::new(QUEUE, "work", serde_json::json!({}))])
        .await
        .unwrap();

    let queued = harness.transport.pending(QUEUE);
    assert!(queued[0].id.is_some());
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_forced_store_ignores_window() {
    let harness = Harness::new();
    let handler = harness.builder().build().await.unwrap();

    handler
        .add_tasks(vec![Task::new(QUEUE, "work", serde_json::json!({})).force_store()])
        .await
        .unwrap();

    assert_eq!(harness.store.len(), 1);
    assert!(harness.transport.pending(QUEUE).is_empty());
}

#[tokio::test]
async fn test_retries_back_off_then_discard() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .config(HandlerConfig::default().discard_sample_rate(1.0))
        .executor(QUEUE, "flaky", AlwaysFail, ExecutorOptions::new())
        .build()
        .await
        .unwrap();

    let mut failing = Task::new(QUEUE, "flaky", serde_json::json!({}))
        .retries(3)
        .retry_after_ms(1000);

    for (attempt, expected_ms) in [(1u32, 1000i64), (2, 4000), (3, 9000)] {
        let before = Utc::now();
        let summary = handler
            .post_process_tasks(PostProcessInput {
                failed: vec![failing.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.retried, 1);

        let retry = harness.transport.pending(QUEUE).last().cloned().unwrap();
        assert_eq!(retry.execution_stats.retry_count, attempt);
        assert_eq!(retry.status, TaskStatus::Scheduled);
        let delay = (retry.execute_at - before).num_milliseconds();
        assert!(
            delay >= expected_ms && delay < expected_ms + 1000,
            "attempt {attempt}: delay {delay}ms"
        );
        failing = retry;
    }

    let summary = handler
        .post_process_tasks(PostProcessInput {
            failed: vec![failing],
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.discarded, 1);
    assert!(harness.store.is_empty());
    assert_eq!(harness.cache.count_prefix("discarded:"), 1);
    assert_eq!(harness.recorder.count("task_exhausted").await, 1);

    let discarded = harness
        .recorder
        .events()
        .await
        .into_iter()
        .find_map(|event| match event {
            LifecycleEvent::TasksDiscarded { count, last_24h, .. } => Some((count, last_24h)),
            _ => None,
        });
    assert_eq!(discarded, Some((1, Some(1))));
}

#[tokio::test]
async fn test_persisted_task_is_marked_failed_when_exhausted() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .executor(QUEUE, "flaky", AlwaysFail, ExecutorOptions::new().retries(0))
        .build()
        .await
        .unwrap();

    let summary = handler
        .process_batch(QUEUE, vec![task("flaky", "t1")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.discarded, 0);
    let stored = harness.store.get(&"t1".into()).unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.execution_stats.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_persisted_task_retry_is_upserted() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .executor(QUEUE, "flaky", Explodes, ExecutorOptions::new())
        .build()
        .await
        .unwrap();

    let summary = handler
        .process_batch(QUEUE, vec![task("flaky", "t1")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.retried, 1);
    let stored = harness.store.get(&"t1".into()).unwrap();
    assert_eq!(stored.status, TaskStatus::Scheduled);
    assert_eq!(stored.execution_stats.retry_count, 1);
    assert!(harness.transport.pending(QUEUE).is_empty());
}

#[tokio::test]
async fn test_store_on_failure_persists_fast_path_retry() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .executor(QUEUE, "flaky", AlwaysFail, ExecutorOptions::new().store_on_failure())
        .build()
        .await
        .unwrap();

    handler
        .post_process_tasks(PostProcessInput {
            failed: vec![Task::new(QUEUE, "flaky", serde_json::json!({"n": 1}))],
            ..Default::default()
        })
        .await
        .unwrap();

    let stored = harness.store.snapshot();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].execution_stats.retry_count, 1);
    assert!(harness.transport.pending(QUEUE).is_empty());
}

#[tokio::test]
async fn test_batch_persists_success_new_and_ignored() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .executor(QUEUE, "spawn", Spawner, ExecutorOptions::new())
        .build()
        .await
        .unwrap();
    harness.store.upsert_tasks(vec![task("spawn", "t1")]).await.unwrap();

    let summary = handler
        .process_batch(
            QUEUE,
            vec![task("spawn", "t1"), task("stray", "t2")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.ignored, 1);
    assert_eq!(harness.store.get(&"t1".into()).unwrap().status, TaskStatus::Executed);
    assert_eq!(harness.store.get(&"t2".into()).unwrap().status, TaskStatus::Ignored);

    let queued = harness.transport.pending(QUEUE);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].task_type, "follow_up");

    let names = harness.recorder.names().await;
    assert_eq!(names.first(), Some(&"batch_started"));
    assert!(names.contains(&"batch_completed"));
}

#[tokio::test]
async fn test_handoff_without_manager_is_a_config_error() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .executor(
            QUEUE,
            "slow",
            Succeed::slow(Duration::from_millis(300)),
            ExecutorOptions::new().async_handoff(Duration::from_millis(50)),
        )
        .build()
        .await
        .unwrap();

    let err = handler
        .process_batch(QUEUE, vec![task("slow", "t1")], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HandlerError::AsyncManagerMissing { count: 1, .. }));
}

#[tokio::test]
async fn test_handoff_to_pool_finalizes_in_background() {
    let harness = Harness::new();
    let pool = AsyncTaskPool::new(4);
    let handler = harness
        .builder()
        .executor(
            QUEUE,
            "slow",
            Succeed::slow(Duration::from_millis(300)),
            ExecutorOptions::new().async_handoff(Duration::from_millis(50)),
        )
        .async_manager(pool.clone())
        .build()
        .await
        .unwrap();
    harness.store.upsert_tasks(vec![task("slow", "t1")]).await.unwrap();

    let summary = handler
        .process_batch(QUEUE, vec![task("slow", "t1")], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.handed_off, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(pool.in_flight(), 1);

    tokio::time::timeout(Duration::from_secs(2), pool.wait_idle())
        .await
        .unwrap();
    assert_eq!(pool.completed(), 1);
    assert_eq!(harness.store.get(&"t1".into()).unwrap().status, TaskStatus::Executed);
}

#[tokio::test]
async fn test_rejected_handoff_is_requeued() {
    let harness = Harness::new();
    let executor = Succeed::slow(Duration::from_millis(300));
    let handler = harness
        .builder()
        .executor(
            QUEUE,
            "slow",
            executor.clone(),
            ExecutorOptions::new().async_handoff(Duration::from_millis(50)),
        )
        .async_manager(RejectingManager)
        .build()
        .await
        .unwrap();

    handler
        .process_batch(QUEUE, vec![task("slow", "t1")], &CancellationToken::new())
        .await
        .unwrap();

    let stored = harness.store.get(&"t1".into()).unwrap();
    assert_eq!(stored.status, TaskStatus::Scheduled);
    assert!(stored.execute_at > Utc::now() + chrono::Duration::seconds(20));
}

#[tokio::test]
async fn test_rejected_handoff_keeps_outcome_of_finished_task() {
    let harness = Harness::new();
    let slow = Succeed::slow(Duration::from_millis(100));
    let handler = harness
        .builder()
        .executor(
            QUEUE,
            "slow",
            slow.clone(),
            ExecutorOptions::new().async_handoff(Duration::from_millis(30)),
        )
        .executor(QUEUE, "sync", Succeed::slow(Duration::from_millis(300)), ExecutorOptions::new())
        .async_manager(RejectingManager)
        .build()
        .await
        .unwrap();
    harness
        .store
        .upsert_tasks(vec![task("slow", "s1"), task("sync", "s2")])
        .await
        .unwrap();

    // s1 outlives its handoff timeout but settles while s2 is still running.
    let summary = handler
        .process_batch(QUEUE, vec![task("slow", "s1"), task("sync", "s2")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.handed_off, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(slow.calls(), 1);
    let s1 = harness.store.get(&"s1".into()).unwrap();
    assert_eq!(s1.status, TaskStatus::Executed);
    assert!(s1.execute_at < Utc::now());
    assert_eq!(harness.store.get(&"s2".into()).unwrap().status, TaskStatus::Executed);
}

#[tokio::test]
async fn test_failed_reschedule_keeps_batch_outcome() {
    let harness = Harness::new();
    let memory = Arc::new(MemoryTaskStore::new());
    let handler = taskloom::TaskHandlerBuilder::new(
        Arc::new(UpsertFails(memory.clone())),
        harness.transport.clone(),
        harness.cache.clone(),
    )
    .executor(QUEUE, "work", Succeed::default(), ExecutorOptions::new())
    .executor(
        QUEUE,
        "slow",
        Succeed::default(),
        ExecutorOptions::new().async_handoff(Duration::from_millis(100)),
    )
    .async_manager(AsyncTaskPool::new(0))
    .build()
    .await
    .unwrap();
    memory.add_tasks_to_scheduled(vec![task("work", "t1")]).await.unwrap();

    let summary = handler
        .process_batch(QUEUE, vec![task("work", "t1"), task("slow", "t2")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.deferred, 0);
    assert_eq!(memory.get(&"t1".into()).unwrap().status, TaskStatus::Executed);
    let returned = harness.transport.pending(QUEUE);
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].context_key(), "t2");
}

#[tokio::test]
async fn test_promotion_moves_mature_tasks() {
    let harness = Harness::new();
    let handler = harness.builder().build().await.unwrap();
    let stored = harness
        .store
        .add_tasks_to_scheduled(vec![
            due_in(Task::new(QUEUE, "work", serde_json::json!({})), -5),
            due_in(Task::new(QUEUE, "work", serde_json::json!({})), 600),
        ])
        .await
        .unwrap();

    assert_eq!(handler.promote_mature_tasks().await.unwrap(), 1);
    assert_eq!(handler.promote_mature_tasks().await.unwrap(), 0);

    let queued = harness.transport.pending(QUEUE);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, stored[0].id);
    assert_eq!(harness.store.with_status(TaskStatus::Processing).len(), 1);
    assert_eq!(harness.cache.count_prefix("promoted:"), 1);
    assert!(!harness.cache.is_locked(PROMOTION_LOCK_KEY).await.unwrap());
}

#[tokio::test]
async fn test_promotion_skips_when_lock_is_held() {
    let harness = Harness::new();
    let handler = harness.builder().build().await.unwrap();
    harness
        .store
        .add_tasks_to_scheduled(vec![due_in(Task::new(QUEUE, "work", serde_json::json!({})), -5)])
        .await
        .unwrap();
    harness
        .cache
        .acquire(PROMOTION_LOCK_KEY, Duration::from_secs(20))
        .await
        .unwrap();

    assert_eq!(handler.promote_mature_tasks().await.unwrap(), 0);
    assert_eq!(harness.store.with_status(TaskStatus::Scheduled).len(), 1);
}

#[tokio::test]
async fn test_consumer_processes_until_cancelled() {
    let harness = Harness::new();
    let executor = Succeed::default();
    let handler = harness
        .builder()
        .executor(QUEUE, "work", executor.clone(), ExecutorOptions::new())
        .build()
        .await
        .unwrap();
    harness.store.upsert_tasks(vec![task("work", "t1")]).await.unwrap();
    handler.add_tasks(vec![task("work", "t1")]).await.unwrap();

    let cancel = CancellationToken::new();
    let consumer = {
        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { handler.start_consuming_tasks(QUEUE, cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(2), async {
        while harness.store.with_status(TaskStatus::Executed).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();

    consumer.await.unwrap().unwrap();
    assert_eq!(harness.store.get(&"t1".into()).unwrap().status, TaskStatus::Executed);
    assert_eq!(handler.worker_stats().succeeded, 1);
}

#[tokio::test]
async fn test_consume_batch_runs_one_batch() {
    let harness = Harness::new();
    let executor = Succeed::default();
    let handler = harness
        .builder()
        .executor(QUEUE, "work", executor.clone(), ExecutorOptions::new())
        .build()
        .await
        .unwrap();
    handler
        .add_tasks((1..=3).map(|n| task("work", &format!("t{n}"))).collect())
        .await
        .unwrap();

    let delivered = handler.consume_batch(QUEUE, 2, &CancellationToken::new()).await.unwrap();

    assert_eq!(delivered, 2);
    assert_eq!(executor.calls(), 2);
    assert_eq!(harness.transport.pending(QUEUE).len(), 1);
}

#[tokio::test]
async fn test_environment_qualifies_queues() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .config(HandlerConfig::default().environment("staging"))
        .executor(QUEUE, "work", Succeed::default(), ExecutorOptions::new())
        .build()
        .await
        .unwrap();

    assert!(harness.transport.is_registered("jobs-staging"));
    handler
        .add_tasks(vec![Task::new(QUEUE, "work", serde_json::json!({}))])
        .await
        .unwrap();
    assert_eq!(harness.transport.pending("jobs-staging").len(), 1);
    assert_eq!(handler.registry().get_task_types_for_queue(QUEUE), vec!["work".to_string()]);
}

#[tokio::test]
async fn test_worker_lifecycle_events() {
    let harness = Harness::new();
    let handler = harness
        .builder()
        .config(
            HandlerConfig::default()
                .promotion_interval(Duration::from_millis(20))
                .heartbeat_interval(Duration::from_millis(20)),
        )
        .executor(QUEUE, "work", Succeed::default(), ExecutorOptions::new())
        .build()
        .await
        .unwrap();
    handler.add_tasks(vec![task("work", "t1")]).await.unwrap();

    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };

    handler.run(&[QUEUE], cancel).await.unwrap();
    stopper.await.unwrap();

    // The task was scheduled before the worker came up.
    let names = harness.recorder.names().await;
    assert_eq!(names.first(), Some(&"task_scheduled"));
    let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
    assert!(position("worker_started") < position("batch_started"));
    assert!(position("batch_completed") < position("worker_stopped"));
    assert_eq!(names.last(), Some(&"worker_stopped"));
    assert!(names.contains(&"worker_heartbeat"));
    assert!(names.contains(&"queue_stats"));

    let stopped = harness.recorder.events().await.pop();
    match stopped {
        Some(LifecycleEvent::WorkerStopped { stats, .. }) => assert_eq!(stats.succeeded, 1),
        other => panic!("unexpected final event: {other:?}"),
    }
}
