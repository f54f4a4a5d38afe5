//! Durable reconciliation: consume loop, promotion, retries and stats.

mod builder;
pub mod discard;
#[allow(clippy::module_inception)]
mod handler;
pub mod promoter;
mod schedule;
pub mod stats;

use thiserror::Error;

use crate::backend::BackendError;
use crate::runner::RunError;

pub use builder::TaskHandlerBuilder;
pub use discard::DiscardTracker;
pub use handler::{BatchSummary, PostProcessInput, PostProcessSummary, TaskHandler};
pub use promoter::MaturePromoter;
pub use schedule::{partition, TaskScheduler};
pub use stats::{QueueStats, QueueStatsSnapshot, WorkerInfo, WorkerMonitor, WorkerStatsSnapshot};

/// Error type for the reconciliation layer.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Run(#[from] RunError),

    /// Tasks were handed off but nothing is configured to own them.
    #[error("queue {queue} handed off {count} task(s) but no async task manager is configured")]
    AsyncManagerMissing { queue: String, count: usize },
}
