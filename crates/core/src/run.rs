//! Run states reported by the scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Time;

/// State of one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRunState {
    /// Finished successfully
    Success,
    /// Finished with an error
    Failed,
    /// Executing
    Running,
    /// Waiting to execute
    Queued,
}

impl fmt::Display for JobRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRunState::Success => write!(f, "success"),
            JobRunState::Failed => write!(f, "failed"),
            JobRunState::Running => write!(f, "running"),
            JobRunState::Queued => write!(f, "queued"),
        }
    }
}

/// Scheduler view of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Scheduled instant
    pub scheduled_at: Time,
    /// Current state
    pub state: JobRunState,
}

impl JobStatus {
    /// Create a status.
    pub fn new(scheduled_at: Time, state: JobRunState) -> Self {
        Self { scheduled_at, state }
    }
}
