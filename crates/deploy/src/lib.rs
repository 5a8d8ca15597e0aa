//! Job deployment (Layer 3)
//!
//! Takes a project's jobs through dependency resolution, priority
//! assignment and upload to the scheduler, and serves deployment requests
//! with a fixed pool of workers.

#![warn(missing_docs)]

pub mod error;
pub mod deployer;
pub mod manager;

pub use error::{DeployError, Result};
pub use deployer::{Deployer, PERSIST_JOB_PREFIX};
pub use manager::DeployManager;
