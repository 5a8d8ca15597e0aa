//! Replays (Layer 3)
//!
//! Re-executes a job and its downstream for past dates: plans the runs to
//! clear, rejects requests that collide with running work, clears the runs
//! in the scheduler from a worker pool and follows the scheduler until every
//! replayed run settles.

#![warn(missing_docs)]

pub mod error;
pub mod plan;
pub mod validator;
pub mod worker;
pub mod syncer;
pub mod manager;

pub use error::{ReplayError, Result};
pub use plan::{get_runs_between_dates, ReplayTreeBuilder};
pub use validator::ReplayValidator;
pub use worker::{ReplayWorker, ReplayWorkerRequest};
pub use syncer::ReplaySyncer;
pub use manager::{ReplayManager, ReplayNodeState, ReplayState};
