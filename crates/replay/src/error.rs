//! Replay errors.

use optimus_core::{ModelError, SchedulerError, Time};
use optimus_storage::StorageError;
use std::time::Duration;

/// Error type for replays.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors raised while planning or running a replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Cron, window or tree error
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Repository error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Scheduler error
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The requested job is not part of the project
    #[error("couldn't find any job with name {0}")]
    JobNotFound(String),

    /// An intra-project upstream is not part of the project
    #[error("{0}: job spec not found")]
    UpstreamNotFound(String),

    /// Start date after end date
    #[error("replay start date {start} is after end date {end}")]
    InvalidRange {
        /// Requested start
        start: Time,
        /// Requested end
        end: Time,
    },

    /// Another replay or a running instance holds the runs
    #[error("conflicted job run found")]
    ConflictedJobRun,

    /// Clearing a job's runs failed
    #[error("error while clearing dag runs for job {job}: {source}")]
    ClearFailed {
        /// Job name
        job: String,
        /// Scheduler error
        source: SchedulerError,
    },

    /// Too many replays are waiting
    #[error("request queue is full")]
    RequestQueueFull,

    /// The manager no longer accepts work
    #[error("replay manager is closed")]
    Closed,

    /// A worker gave up on a replay
    #[error("replay timed out after {0:?}")]
    Timeout(Duration),
}
