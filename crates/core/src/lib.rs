//! Optimus core data models.
//!
//! This crate defines the data structures shared by the dependency resolver,
//! the deployment pipeline and the replay engine, together with the window,
//! cron and tree primitives they evaluate.

#![warn(missing_docs)]

// Core identities
mod id;
mod error;

// Tenancy and jobs
mod project;
mod job;
mod resource;

// Time
pub mod duration;
pub mod cron;
pub mod window;

// Graphs
pub mod tree;

// Lifecycles
mod deployment;
mod replay;
mod run;

// Collaborators
pub mod progress;
pub mod scheduler;
pub mod config;

// Re-exports
pub use id::*;
pub use error::{ModelError, Result, CYCLE_DEPENDENCY_MESSAGE};

pub use project::{ProjectSpec, NamespaceSpec, ProjectRef};
pub use job::{
    JobSpec, JobSchedule, JobBehavior, RetryPolicy, Notifier, NotifyEvent, JobTask, JobHook,
    JobDependency, DependencyType, JobRef, HttpDependency, ExternalDependency, OptimusDependency,
    UnknownDependency, JobSpecFilter, JobIdDependencyPair, split_project_job_name,
    group_by_namespace, PROJECT_JOB_SEPARATOR,
};
pub use resource::{ResourceSpec, ResourceType};

pub use crate::cron::CronSchedule;
pub use window::{TimeRange, Window, WindowV1, WindowV2};
pub use tree::{MultiRootTree, NodeId, TreeNode};

pub use deployment::{DeploymentStatus, JobDeployment, JobDeploymentDetail, JobDeploymentFailure};
pub use replay::{
    ReplayMessage, ReplayPlan, ReplayRequest, ReplaySpec, ReplayStatus, ALL_NAMESPACES,
    MESSAGE_ALL_RUNS_SUCCEEDED, MESSAGE_CLEAR_RUN_FAILED, MESSAGE_CONFLICTED_JOB_RUN,
    MESSAGE_INSTANCE_RUN_FAILED, MESSAGE_REQUEST_QUEUE_FULL, MESSAGE_RUNTIME_TIMEOUT,
};
pub use run::{JobRunState, JobStatus};

pub use progress::{Observer, ProgressEvent};
pub use scheduler::{Scheduler, SchedulerError, SchedulerResult};
pub use config::{
    Config, ConfigError, DeployConfig, ReplayConfig, ResourceManagerConfig, ResourceManagerEndpoint,
    LOG_LEVEL_ENV, RESOURCE_MANAGER_OPTIMUS,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
