//! Outcome accumulation for one run.
//!
//! Executors report what happened to each task through [`Actions`] (or the
//! per-task [`TaskActions`] handle forked from it). The orchestrator harvests
//! the synchronous results at the end of the run; tasks that were handed off
//! are harvested later by their [`AsyncActions`] finalizer.

mod accumulator;
mod async_actions;
mod context;

pub use accumulator::{ActionError, Actions, TaskActions};
pub use async_actions::{AsyncActions, FinalizeError};
pub use context::{classify, Action, ActionContext, ActionResults, TaskResultStatus};
