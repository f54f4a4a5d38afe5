//! SQLite implementation of TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{BackendError, TaskStore};
use crate::task::{ExecutionStats, Task, TaskId, TaskStatus};

const COLUMNS: &str = "id, type, queue_id, payload, execute_at, expires_at, status, retries, retry_after, \
    execution_stats, created_at, updated_at, processing_started_at, force_store, task_group, task_hash";

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    #[sqlx(rename = "type")]
    task_type: String,
    queue_id: String,
    payload: Option<String>,
    execute_at: String,
    expires_at: Option<String>,
    status: String,
    retries: Option<i64>,
    retry_after: Option<i64>,
    execution_stats: String,
    created_at: String,
    updated_at: String,
    processing_started_at: Option<String>,
    force_store: bool,
    task_group: Option<String>,
    task_hash: Option<String>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, BackendError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackendError::Serialization(format!("bad timestamp {raw:?}: {e}")))
}

impl TryFrom<TaskRow> for Task {
    type Error = BackendError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let payload = match row.payload {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| BackendError::Serialization(e.to_string()))?,
            None => serde_json::Value::Null,
        };
        let execution_stats: ExecutionStats = serde_json::from_str(&row.execution_stats)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        Ok(Task {
            id: Some(TaskId(row.id)),
            task_type: row.task_type,
            queue_id: row.queue_id,
            payload,
            execute_at: parse_timestamp(&row.execute_at)?,
            expires_at: row.expires_at.as_deref().map(parse_timestamp).transpose()?,
            status: row.status.parse().map_err(BackendError::Serialization)?,
            retries: row.retries.map(|n| n.max(0) as u32),
            retry_after: row.retry_after.map(|ms| ms.max(0) as u64),
            execution_stats,
            created_at: Some(parse_timestamp(&row.created_at)?),
            updated_at: Some(parse_timestamp(&row.updated_at)?),
            processing_started_at: row.processing_started_at.as_deref().map(parse_timestamp).transpose()?,
            force_store: row.force_store,
            task_group: row.task_group,
            task_hash: row.task_hash,
            transient_key: None,
        })
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the tasks table.
    pub async fn run_migrations(&self) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS taskloom_tasks (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                queue_id TEXT NOT NULL,
                payload TEXT,
                execute_at TEXT NOT NULL,
                expires_at TEXT,
                status TEXT NOT NULL DEFAULT 'scheduled',
                retries INTEGER,
                retry_after INTEGER,
                execution_stats TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                processing_started_at TEXT,
                force_store INTEGER NOT NULL DEFAULT 0,
                task_group TEXT,
                task_hash TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_taskloom_tasks_mature
            ON taskloom_tasks(status, execute_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn upsert_in(tx: &mut Transaction<'_, Sqlite>, task: &Task, now: DateTime<Utc>) -> Result<(), BackendError> {
        let id = task
            .id
            .as_ref()
            .ok_or_else(|| BackendError::Storage(format!("upsert of task without id (type {})", task.task_type)))?;
        let payload = if task.payload.is_null() {
            None
        } else {
            Some(serde_json::to_string(&task.payload).map_err(|e| BackendError::Serialization(e.to_string()))?)
        };
        let stats =
            serde_json::to_string(&task.execution_stats).map_err(|e| BackendError::Serialization(e.to_string()))?;
        let created_at = task.created_at.unwrap_or(now);

        sqlx::query(
            r#"
            INSERT INTO taskloom_tasks (
                id, type, queue_id, payload, execute_at, expires_at, status, retries, retry_after,
                execution_stats, created_at, updated_at, processing_started_at, force_store, task_group, task_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                queue_id = excluded.queue_id,
                payload = COALESCE(excluded.payload, taskloom_tasks.payload),
                execute_at = excluded.execute_at,
                expires_at = excluded.expires_at,
                status = excluded.status,
                retries = excluded.retries,
                retry_after = excluded.retry_after,
                execution_stats = excluded.execution_stats,
                updated_at = excluded.updated_at,
                processing_started_at = excluded.processing_started_at,
                force_store = excluded.force_store,
                task_group = excluded.task_group,
                task_hash = excluded.task_hash
            "#,
        )
        .bind(id.as_str())
        .bind(&task.task_type)
        .bind(&task.queue_id)
        .bind(payload)
        .bind(timestamp(task.execute_at))
        .bind(task.expires_at.map(timestamp))
        .bind(task.status.as_str())
        .bind(task.retries.map(i64::from))
        .bind(task.retry_after.map(|ms| ms as i64))
        .bind(stats)
        .bind(timestamp(created_at))
        .bind(timestamp(now))
        .bind(task.processing_started_at.map(timestamp))
        .bind(task.force_store)
        .bind(&task.task_group)
        .bind(&task.task_hash)
        .execute(&mut **tx)
        .await
        .map_err(|e| BackendError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn write_all(&self, tasks: &[Task]) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BackendError::Storage(e.to_string()))?;
        for task in tasks {
            Self::upsert_in(&mut tx, task, now).await?;
        }
        tx.commit().await.map_err(|e| BackendError::Storage(e.to_string()))
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn add_tasks_to_scheduled(&self, tasks: Vec<Task>) -> Result<Vec<Task>, BackendError> {
        let now = Utc::now();
        let tasks: Vec<Task> = tasks
            .into_iter()
            .map(|mut task| {
                task.ensure_id(|| self.generate_id());
                task.status = TaskStatus::Scheduled;
                task.created_at.get_or_insert(now);
                task.updated_at = Some(now);
                task.transient_key = None;
                task
            })
            .collect();
        self.write_all(&tasks).await?;
        Ok(tasks)
    }

    async fn get_mature_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, BackendError> {
        // Select and claim in one transaction so concurrent promoters never
        // both pick a row.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BackendError::Storage(e.to_string()))?;

        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM taskloom_tasks WHERE status = 'scheduled' AND execute_at <= ? ORDER BY execute_at"
        ))
        .bind(timestamp(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| BackendError::Storage(e.to_string()))?;

        if rows.is_empty() {
            tx.commit().await.map_err(|e| BackendError::Storage(e.to_string()))?;
            return Ok(vec![]);
        }

        let update = format!(
            "UPDATE taskloom_tasks SET status = 'processing', processing_started_at = ?, updated_at = ? WHERE id IN ({})",
            placeholders(rows.len())
        );
        let mut query = sqlx::query(&update).bind(timestamp(now)).bind(timestamp(now));
        for row in &rows {
            query = query.bind(row.id.clone());
        }
        query
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::Storage(e.to_string()))?;

        tx.commit().await.map_err(|e| BackendError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let mut task = Task::try_from(row)?;
                task.status = TaskStatus::Processing;
                task.processing_started_at = Some(now);
                task.updated_at = Some(now);
                Ok(task)
            })
            .collect()
    }

    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> Result<(), BackendError> {
        let ids: Vec<&str> = tasks.iter().filter_map(|t| t.id.as_ref()).map(TaskId::as_str).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let update = format!(
            "UPDATE taskloom_tasks SET status = 'executed', updated_at = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&update).bind(timestamp(Utc::now()));
        for id in ids {
            query = query.bind(id);
        }
        query
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn upsert_tasks(&self, tasks: Vec<Task>) -> Result<(), BackendError> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.write_all(&tasks).await
    }

    async fn get_tasks_by_ids(&self, ids: &[TaskId]) -> Result<Vec<Task>, BackendError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let select = format!(
            "SELECT {COLUMNS} FROM taskloom_tasks WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query_as::<_, TaskRow>(&select);
        for id in ids {
            query = query.bind(id.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::Storage(e.to_string()))?;

        rows.into_iter().map(Task::try_from).collect()
    }
}
