//! Task model shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a durable task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Scheduled,
    Processing,
    Executed,
    Failed,
    Ignored,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            "ignored" => Ok(Self::Ignored),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Free-form execution bookkeeping carried on every task.
///
/// The named fields are the ones the engine reads and writes; anything else an
/// executor or store puts here survives round-trips through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored_reason: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub queue_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub execute_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Max attempts override; falls back to the executor's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Base backoff in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default)]
    pub execution_stats: ExecutionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub force_store: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_hash: Option<String>,
    /// Run-local identity for tasks that have no id yet.
    #[serde(skip)]
    pub(crate) transient_key: Option<String>,
}

impl Task {
    /// Create a task due now.
    pub fn new(queue_id: &str, task_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            task_type: task_type.to_string(),
            queue_id: queue_id.to_string(),
            payload,
            execute_at: Utc::now(),
            expires_at: None,
            status: TaskStatus::Scheduled,
            retries: None,
            retry_after: None,
            execution_stats: ExecutionStats::default(),
            created_at: None,
            updated_at: None,
            processing_started_at: None,
            force_store: false,
            task_group: None,
            task_hash: None,
            transient_key: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn execute_at(mut self, at: DateTime<Utc>) -> Self {
        self.execute_at = at;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after = Some(ms);
        self
    }

    pub fn force_store(mut self) -> Self {
        self.force_store = true;
        self
    }

    pub fn task_hash(mut self, hash: &str) -> Self {
        self.task_hash = Some(hash.to_string());
        self
    }

    pub fn task_group(mut self, group: &str) -> Self {
        self.task_group = Some(group.to_string());
        self
    }

    /// Key under which this task's outcome is accumulated during a run.
    pub fn context_key(&self) -> String {
        match (&self.id, &self.transient_key) {
            (Some(id), _) => id.0.clone(),
            (None, Some(key)) => key.clone(),
            (None, None) => format!("{}:{}", self.queue_id, self.task_type),
        }
    }

    /// Key used for the per-task distributed lock, if the task can be locked.
    pub fn lock_key(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(format!("task_lock:{}", id));
        }
        self.task_hash
            .as_ref()
            .map(|hash| format!("task_lock:{}:hash:{}", self.queue_id, hash))
    }

    /// Give an id-less task a run-local identity so its outcome can be tracked.
    pub(crate) fn ensure_transient_key(&mut self) {
        if self.id.is_none() && self.transient_key.is_none() {
            self.transient_key = Some(format!("transient:{}", uuid::Uuid::new_v4()));
        }
    }

    /// Assigns an id if the task has none. Returns true when one was generated.
    pub(crate) fn ensure_id(&mut self, generate: impl FnOnce() -> TaskId) -> bool {
        if self.id.is_some() {
            return false;
        }
        self.id = Some(generate());
        true
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}
