//! Action log and the reducer that classifies it.

use chrono::{DateTime, Utc};

use crate::task::{Task, TaskStatus};

/// One recorded outcome event.
#[derive(Debug, Clone)]
pub enum Action {
    Success { task: Task, at: DateTime<Utc> },
    Fail { task: Task, error: Option<String>, at: DateTime<Utc> },
    AddTasks { tasks: Vec<Task>, at: DateTime<Utc> },
}

impl Action {
    /// Key of the task a success/fail targets.
    pub(crate) fn target_key(&self) -> Option<String> {
        match self {
            Self::Success { task, .. } | Self::Fail { task, .. } => Some(task.context_key()),
            Self::AddTasks { .. } => None,
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, Self::AddTasks { .. })
    }
}

/// Everything recorded for one task (or the run-wide batch) in a run.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub task: Option<Task>,
    pub actions: Vec<Action>,
}

impl ActionContext {
    pub fn for_task(task: Task) -> Self {
        Self {
            task: Some(task),
            actions: Vec::new(),
        }
    }

    pub fn status(&self) -> TaskResultStatus {
        for action in &self.actions {
            match action {
                Action::Success { .. } => return TaskResultStatus::Succeeded,
                Action::Fail { .. } => return TaskResultStatus::Failed,
                Action::AddTasks { .. } => {}
            }
        }
        TaskResultStatus::Pending
    }

    pub(crate) fn has_terminal(&self) -> bool {
        self.actions.iter().any(Action::is_terminal)
    }
}

/// Where a task stands within the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResultStatus {
    /// Nothing terminal recorded yet.
    Pending,
    Succeeded,
    Failed,
}

/// Classified output of one or more contexts.
#[derive(Debug, Clone, Default)]
pub struct ActionResults {
    pub success_tasks: Vec<Task>,
    pub failed_tasks: Vec<Task>,
    pub new_tasks: Vec<Task>,
    pub ignored_tasks: Vec<Task>,
}

impl ActionResults {
    pub fn is_empty(&self) -> bool {
        self.success_tasks.is_empty()
            && self.failed_tasks.is_empty()
            && self.new_tasks.is_empty()
            && self.ignored_tasks.is_empty()
    }

    pub fn merge(&mut self, other: ActionResults) {
        self.success_tasks.extend(other.success_tasks);
        self.failed_tasks.extend(other.failed_tasks);
        self.new_tasks.extend(other.new_tasks);
        self.ignored_tasks.extend(other.ignored_tasks);
    }
}

/// Classify one context.
///
/// A context bound to a task with no actions is an ignored task. Otherwise
/// actions are folded in order; failed tasks carry their error and failure
/// time in `execution_stats`.
pub fn classify(context: &ActionContext) -> ActionResults {
    let mut results = ActionResults::default();

    if context.actions.is_empty() {
        if let Some(task) = &context.task {
            let mut task = task.clone();
            task.status = TaskStatus::Ignored;
            results.ignored_tasks.push(task);
        }
        return results;
    }

    for action in &context.actions {
        match action {
            Action::Success { task, .. } => results.success_tasks.push(task.clone()),
            Action::Fail { task, error, at } => {
                let mut task = task.clone();
                task.execution_stats.last_error = error.clone();
                task.execution_stats.failed_at = Some(*at);
                results.failed_tasks.push(task);
            }
            Action::AddTasks { tasks, .. } => results.new_tasks.extend(tasks.iter().cloned()),
        }
    }

    results
}
