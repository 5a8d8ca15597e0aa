//! Capabilities required from the external scheduler.

use async_trait::async_trait;

use crate::deployment::JobDeploymentDetail;
use crate::job::JobSpec;
use crate::progress::Observer;
use crate::project::{NamespaceSpec, ProjectSpec};
use crate::run::JobStatus;
use crate::Time;

/// Error type for scheduler calls.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Errors returned by the scheduler adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler could not be reached or answered with an error
    #[error("scheduler request failed: {0}")]
    Request(String),

    /// The scheduler does not know the job
    #[error("job not found in scheduler: {0}")]
    JobNotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// The scheduler that runs compiled jobs.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Compile and upload jobs of one namespace.
    ///
    /// Per-job failures are reported in the returned detail; an error means
    /// the namespace as a whole could not be deployed.
    async fn deploy_jobs(
        &self,
        namespace: &NamespaceSpec,
        jobs: &[JobSpec],
        observer: Option<&dyn Observer>,
    ) -> SchedulerResult<JobDeploymentDetail>;

    /// Names of jobs currently deployed in a namespace.
    async fn list_jobs(&self, namespace: &NamespaceSpec) -> SchedulerResult<Vec<String>>;

    /// Remove jobs from a namespace.
    async fn delete_jobs(
        &self,
        namespace: &NamespaceSpec,
        job_names: &[String],
        observer: Option<&dyn Observer>,
    ) -> SchedulerResult<()>;

    /// Run states of a job's runs scheduled in `[start, end]`.
    async fn get_job_run_status(
        &self,
        project: &ProjectSpec,
        job_name: &str,
        start: Time,
        end: Time,
        batch_size: usize,
    ) -> SchedulerResult<Vec<JobStatus>>;

    /// Re-execute a job's runs scheduled in `[start, end]`.
    async fn clear(
        &self,
        project: &ProjectSpec,
        job_name: &str,
        start: Time,
        end: Time,
    ) -> SchedulerResult<()>;
}
