//! Per-run outcome accumulator.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use super::context::{classify, Action, ActionContext, ActionResults, TaskResultStatus};
use crate::task::Task;

/// Error returned when recording an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// A success or fail was already recorded for this task in this run.
    #[error("task {key} already resolved ({status:?})")]
    AlreadyResolved { key: String, status: TaskResultStatus },
}

#[derive(Default)]
struct ActionsState {
    contexts: HashMap<String, ActionContext>,
    /// First-reference order of context keys; may hold keys already extracted.
    order: Vec<String>,
}

impl ActionsState {
    fn context_mut(&mut self, key: &str, task: Option<&Task>) -> &mut ActionContext {
        if !self.contexts.contains_key(key) {
            self.order.push(key.to_string());
        }
        let context = self.contexts.entry(key.to_string()).or_default();
        if context.task.is_none() {
            context.task = task.cloned();
        }
        context
    }

    /// Remove and classify one context, dropping any other context its
    /// success/fail actions resolved.
    fn extract(&mut self, key: &str, keep: &HashSet<String>) -> ActionResults {
        let Some(context) = self.contexts.remove(key) else {
            return ActionResults::default();
        };
        for target in context.actions.iter().filter_map(Action::target_key) {
            if target != key && !keep.contains(&target) {
                self.contexts.remove(&target);
            }
        }
        classify(&context)
    }
}

/// Outcome accumulator for one run.
///
/// Cheap to clone; every clone shares the same contexts. A context is created
/// on first reference and deleted when extracted, so each task is harvested at
/// most once.
#[derive(Clone)]
pub struct Actions {
    run_id: String,
    batch_key: String,
    state: Arc<Mutex<ActionsState>>,
}

impl Actions {
    pub fn new(run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            batch_key: format!("batch:{run_id}"),
            run_id,
            state: Arc::new(Mutex::new(ActionsState::default())),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Handle whose calls land in `task`'s own context.
    pub fn fork_for_task(&self, task: &Task) -> TaskActions {
        self.state.lock().context_mut(&task.context_key(), Some(task));
        TaskActions {
            root: self.clone(),
            task: task.clone(),
        }
    }

    /// Record success for `task`.
    pub fn success(&self, task: &Task) -> Result<(), ActionError> {
        self.record_terminal(
            task,
            Action::Success {
                task: task.clone(),
                at: Utc::now(),
            },
        )
    }

    /// Record failure for `task`.
    pub fn fail(&self, task: &Task, error: impl Into<String>) -> Result<(), ActionError> {
        self.record_terminal(
            task,
            Action::Fail {
                task: task.clone(),
                error: Some(error.into()),
                at: Utc::now(),
            },
        )
    }

    /// Queue follow-up work not attributable to a single task.
    pub fn add_tasks(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let batch_key = self.batch_key.clone();
        self.state
            .lock()
            .context_mut(&batch_key, None)
            .actions
            .push(Action::AddTasks { tasks, at: Utc::now() });
    }

    /// Mark a task as ignored: a bound context with no actions.
    pub fn add_ignored_task(&self, task: &Task) {
        self.state.lock().context_mut(&task.context_key(), Some(task));
    }

    pub fn task_result_status(&self, key: &str) -> TaskResultStatus {
        self.state
            .lock()
            .contexts
            .get(key)
            .map(ActionContext::status)
            .unwrap_or(TaskResultStatus::Pending)
    }

    /// Classify a context without consuming it.
    pub fn task_result(&self, key: &str) -> Option<ActionResults> {
        self.state.lock().contexts.get(key).map(classify)
    }

    /// Harvest-and-delete one task's context.
    pub fn extract_task_actions(&self, key: &str) -> ActionResults {
        self.state.lock().extract(key, &HashSet::new())
    }

    /// Harvest-and-delete every context except `exclude`, merging the
    /// run-wide batch context in as new tasks.
    pub fn extract_sync_results(&self, exclude: &HashSet<String>) -> ActionResults {
        let mut state = self.state.lock();
        let order = std::mem::take(&mut state.order);
        let mut results = ActionResults::default();

        for key in &order {
            if key == &self.batch_key || exclude.contains(key) {
                continue;
            }
            results.merge(state.extract(key, exclude));
        }
        results.merge(state.extract(&self.batch_key, exclude));

        let remaining: Vec<String> = order
            .into_iter()
            .filter(|key| state.contexts.contains_key(key))
            .collect();
        state.order = remaining;
        results
    }

    /// Number of contexts not yet extracted.
    pub fn open_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Fail `task` unless a terminal action was already recorded. Check and
    /// write happen under one lock.
    pub(crate) fn fail_if_pending(&self, task: &Task, error: &str) -> bool {
        let mut state = self.state.lock();
        let context = state.context_mut(&task.context_key(), Some(task));
        if context.has_terminal() {
            return false;
        }
        context.actions.push(Action::Fail {
            task: task.clone(),
            error: Some(error.to_string()),
            at: Utc::now(),
        });
        true
    }

    fn add_tasks_for(&self, task: &Task, tasks: Vec<Task>) {
        self.state
            .lock()
            .context_mut(&task.context_key(), Some(task))
            .actions
            .push(Action::AddTasks { tasks, at: Utc::now() });
    }

    fn record_terminal(&self, task: &Task, action: Action) -> Result<(), ActionError> {
        let key = task.context_key();
        let mut state = self.state.lock();
        let context = state.context_mut(&key, Some(task));
        let status = context.status();
        if status != TaskResultStatus::Pending {
            tracing::warn!(
                run_id = %self.run_id,
                task = %key,
                ?status,
                "Executor resolved a task twice; keeping the first outcome"
            );
            return Err(ActionError::AlreadyResolved { key, status });
        }
        context.actions.push(action);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_raw(&self, key: &str, action: Action) {
        self.state.lock().context_mut(key, None).actions.push(action);
    }
}

/// Accumulator handle bound to one task.
#[derive(Clone)]
pub struct TaskActions {
    root: Actions,
    task: Task,
}

impl TaskActions {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn success(&self) -> Result<(), ActionError> {
        self.root.success(&self.task)
    }

    pub fn fail(&self, error: impl Into<String>) -> Result<(), ActionError> {
        self.root.fail(&self.task, error)
    }

    /// Queue follow-up tasks produced by this task.
    pub fn add_tasks(&self, tasks: Vec<Task>) {
        if !tasks.is_empty() {
            self.root.add_tasks_for(&self.task, tasks);
        }
    }

    pub fn status(&self) -> TaskResultStatus {
        self.root.task_result_status(&self.task.context_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task::new("q", "t", serde_json::Value::Null).with_id(id)
    }

    #[test]
    fn test_forked_handles_are_isolated() {
        let actions = Actions::new("run-1");
        let a = actions.fork_for_task(&task("a"));
        let b = actions.fork_for_task(&task("b"));
        a.success().unwrap();
        b.fail("nope").unwrap();

        assert_eq!(a.status(), TaskResultStatus::Succeeded);
        assert_eq!(b.status(), TaskResultStatus::Failed);

        let results = actions.extract_sync_results(&HashSet::new());
        assert_eq!(results.success_tasks.len(), 1);
        assert_eq!(results.failed_tasks.len(), 1);
        assert_eq!(actions.open_contexts(), 0);
    }

    #[test]
    fn test_second_terminal_action_is_rejected() {
        let actions = Actions::new("run-1");
        let handle = actions.fork_for_task(&task("a"));
        handle.success().unwrap();
        assert_eq!(
            handle.fail("late"),
            Err(ActionError::AlreadyResolved {
                key: "a".to_string(),
                status: TaskResultStatus::Succeeded,
            })
        );

        let results = actions.extract_task_actions("a");
        assert_eq!(results.success_tasks.len(), 1);
        assert!(results.failed_tasks.is_empty());
    }

    #[test]
    fn test_fail_if_pending_respects_existing_outcome() {
        let actions = Actions::new("run-1");
        actions.success(&task("a")).unwrap();
        assert!(!actions.fail_if_pending(&task("a"), "boom"));
        assert!(actions.fail_if_pending(&task("b"), "boom"));
        assert_eq!(actions.task_result_status("b"), TaskResultStatus::Failed);
    }

    #[test]
    fn test_root_calls_create_contexts_on_demand() {
        let actions = Actions::new("run-1");
        actions.fail(&task("x"), "bad input").unwrap();
        let results = actions.extract_task_actions("x");
        assert_eq!(results.failed_tasks.len(), 1);
    }

    #[test]
    fn test_extraction_is_single_shot() {
        let actions = Actions::new("run-1");
        actions.success(&task("a")).unwrap();
        assert_eq!(actions.extract_task_actions("a").success_tasks.len(), 1);
        assert!(actions.extract_task_actions("a").is_empty());
    }

    #[test]
    fn test_inspection_does_not_consume() {
        let actions = Actions::new("run-1");
        actions.success(&task("a")).unwrap();
        assert_eq!(actions.task_result("a").unwrap().success_tasks.len(), 1);
        assert_eq!(actions.open_contexts(), 1);
    }

    #[test]
    fn test_ignored_task_classification() {
        let actions = Actions::new("run-1");
        actions.add_ignored_task(&task("a"));
        let results = actions.extract_sync_results(&HashSet::new());
        assert_eq!(results.ignored_tasks.len(), 1);
    }

    #[test]
    fn test_batch_context_merges_as_new_tasks() {
        let actions = Actions::new("run-1");
        actions.add_tasks(vec![Task::new("q", "follow", serde_json::Value::Null)]);
        actions.success(&task("a")).unwrap();
        let results = actions.extract_sync_results(&HashSet::new());
        assert_eq!(results.new_tasks.len(), 1);
        assert_eq!(results.success_tasks.len(), 1);
        assert!(results.ignored_tasks.is_empty());
    }

    #[test]
    fn test_excluded_context_survives_sync_harvest() {
        let actions = Actions::new("run-1");
        let handle = actions.fork_for_task(&task("async"));
        actions.success(&task("sync")).unwrap();

        let exclude: HashSet<String> = ["async".to_string()].into_iter().collect();
        let results = actions.extract_sync_results(&exclude);
        assert_eq!(results.success_tasks.len(), 1);
        assert!(results.ignored_tasks.is_empty());

        handle.success().unwrap();
        let later = actions.extract_task_actions("async");
        assert_eq!(later.success_tasks.len(), 1);
        assert_eq!(actions.open_contexts(), 0);
    }

    #[test]
    fn test_cross_task_action_deletes_other_context() {
        let actions = Actions::new("run-1");
        actions.fork_for_task(&task("b"));
        actions.push_raw(
            "a",
            Action::Success {
                task: task("b"),
                at: Utc::now(),
            },
        );
        let results = actions.extract_task_actions("a");
        assert_eq!(results.success_tasks.len(), 1);
        assert_eq!(actions.open_contexts(), 0);
    }

    #[test]
    fn test_task_actions_add_tasks_attach_to_task() {
        let actions = Actions::new("run-1");
        let handle = actions.fork_for_task(&task("a"));
        handle.add_tasks(vec![Task::new("q", "child", serde_json::Value::Null)]);
        assert_eq!(handle.status(), TaskResultStatus::Pending);
        handle.success().unwrap();
        let results = actions.extract_task_actions("a");
        assert_eq!(results.new_tasks.len(), 1);
        assert_eq!(results.success_tasks.len(), 1);
    }
}
