//! Batch orchestration and async handoff.

mod async_pool;
mod lock;
#[allow(clippy::module_inception)]
mod runner;

pub use async_pool::AsyncTaskPool;
pub use lock::LockBatch;
pub use runner::{AsyncTask, RunError, RunResult, TaskRunner};
