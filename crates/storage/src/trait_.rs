//! Repository traits.
//!
//! Each trait covers one aggregate. Implementations must be safe to share
//! between tasks; every method takes `&self`.

use async_trait::async_trait;
use optimus_core::{
    DeploymentId, DeploymentStatus, JobDeployment, JobId, JobIdDependencyPair, JobSpec,
    NamespaceSpec, ProjectId, ProjectSpec, ReplayId, ReplayMessage, ReplaySpec, ReplayStatus, Time,
};
use std::collections::HashMap;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness rule would be broken
    #[error("conflict: {0}")]
    Conflict(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A job together with the project that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectJobPair {
    /// Owning project
    pub project: ProjectSpec,
    /// The job
    pub job: JobSpec,
}

/// Projects, unique by name.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Create or replace a project.
    async fn save(&self, project: &ProjectSpec) -> Result<()>;

    /// Load a project by name.
    async fn get_by_name(&self, name: &str) -> Result<ProjectSpec>;

    /// List all projects.
    async fn get_all(&self) -> Result<Vec<ProjectSpec>>;
}

/// Namespaces of a project, unique by name within it.
#[async_trait]
pub trait NamespaceRepository: Send + Sync {
    /// Create or replace a namespace.
    async fn save(&self, namespace: &NamespaceSpec) -> Result<()>;

    /// Load a namespace by name.
    async fn get_by_name(&self, project: &ProjectSpec, name: &str) -> Result<NamespaceSpec>;

    /// List namespaces of a project.
    async fn get_all(&self, project: &ProjectSpec) -> Result<Vec<NamespaceSpec>>;
}

/// Job specifications across projects.
#[async_trait]
pub trait JobSpecRepository: Send + Sync {
    /// All jobs of a project.
    async fn get_all(&self, project: &ProjectSpec) -> Result<Vec<JobSpec>>;

    /// One job of a project.
    async fn get_by_name(&self, project: &ProjectSpec, name: &str) -> Result<JobSpec>;

    /// One job looked up by project and job name.
    async fn get_by_name_for_project(&self, project_name: &str, job_name: &str) -> Result<ProjectJobPair>;

    /// Jobs writing to a destination URN, in any project.
    ///
    /// Returns `NotFound` when no job claims the destination.
    async fn get_by_destination(&self, destination: &str) -> Result<Vec<ProjectJobPair>>;

    /// Jobs by id, in any project. Unknown ids are skipped.
    async fn get_by_ids(&self, ids: &[JobId]) -> Result<Vec<ProjectJobPair>>;

    /// Create or replace a job.
    async fn save(&self, project: &ProjectSpec, job: &JobSpec) -> Result<()>;

    /// Remove a job.
    async fn delete(&self, project: &ProjectSpec, name: &str) -> Result<()>;
}

/// Resolved dependency edges, persisted between deployments.
#[async_trait]
pub trait JobDependencyRepository: Send + Sync {
    /// Replace the stored edges of one job.
    async fn save(&self, project: &ProjectSpec, job_id: JobId, pairs: &[JobIdDependencyPair]) -> Result<()>;

    /// All stored edges of a project's jobs.
    async fn get_all(&self, project: &ProjectSpec) -> Result<Vec<JobIdDependencyPair>>;

    /// Forget the edges of one job.
    async fn delete_by_job_id(&self, job_id: JobId) -> Result<()>;
}

/// Dependencies that could not be resolved on this control plane.
#[async_trait]
pub trait UnknownJobDependencyRepository: Send + Sync {
    /// Record the unresolved names of one job, replacing earlier records.
    async fn save(
        &self,
        project: &ProjectSpec,
        job_name: &str,
        inferred_urns: &[String],
        static_names: &[String],
    ) -> Result<()>;

    /// Unresolved inferred destination URNs keyed by job name.
    async fn get_unknown_inferred_dependency_urns_by_job_name(
        &self,
        project: &ProjectSpec,
    ) -> Result<HashMap<String, Vec<String>>>;

    /// Unresolved static dependency names keyed by job name.
    async fn get_unknown_static_dependency_names_by_job_name(
        &self,
        project: &ProjectSpec,
    ) -> Result<HashMap<String, Vec<String>>>;
}

/// Deployment requests.
#[async_trait]
pub trait JobDeploymentRepository: Send + Sync {
    /// Insert a new deployment.
    async fn save(&self, deployment: &JobDeployment) -> Result<()>;

    /// Insert `deployment` unless its project already has a queued one.
    ///
    /// Returns the queued deployment of the project, which is `deployment`
    /// itself when it was inserted. Check and insert happen atomically.
    async fn save_if_not_queued(&self, deployment: &JobDeployment) -> Result<JobDeployment>;

    /// Overwrite status, details and update time.
    async fn update_by_id(&self, deployment: &JobDeployment) -> Result<()>;

    /// Overwrite status, details and update time if the stored row is still
    /// in `from` and untouched since `updated_at`.
    ///
    /// Returns whether the row changed.
    async fn update_by_id_if(
        &self,
        deployment: &JobDeployment,
        from: DeploymentStatus,
        updated_at: Time,
    ) -> Result<bool>;

    /// Move a deployment to `to` if it is still in `from` and untouched since `updated_at`.
    ///
    /// Returns whether the row changed.
    async fn update_status_if(
        &self,
        id: DeploymentId,
        from: DeploymentStatus,
        updated_at: Time,
        to: DeploymentStatus,
    ) -> Result<bool>;

    /// Load a deployment.
    async fn get_by_id(&self, id: DeploymentId) -> Result<JobDeployment>;

    /// Deployments in a status, oldest first.
    async fn get_by_status(&self, status: DeploymentStatus) -> Result<Vec<JobDeployment>>;

    /// The deployment of a project in a status.
    async fn get_by_status_and_project_id(
        &self,
        status: DeploymentStatus,
        project_id: ProjectId,
    ) -> Result<JobDeployment>;

    /// The oldest queued deployment.
    async fn get_first_executable_request(&self) -> Result<JobDeployment>;
}

/// Replays.
#[async_trait]
pub trait ReplaySpecRepository: Send + Sync {
    /// Insert a new replay.
    async fn insert(&self, replay: &ReplaySpec) -> Result<()>;

    /// Change the status of a replay.
    async fn update_status(&self, id: ReplayId, status: ReplayStatus, message: ReplayMessage) -> Result<()>;

    /// Load a replay.
    async fn get_by_id(&self, id: ReplayId) -> Result<ReplaySpec>;

    /// Replays in any of the statuses.
    async fn get_by_status(&self, statuses: &[ReplayStatus]) -> Result<Vec<ReplaySpec>>;

    /// Replays of a project in any of the statuses.
    async fn get_by_project_id_and_status(
        &self,
        project_id: ProjectId,
        statuses: &[ReplayStatus],
    ) -> Result<Vec<ReplaySpec>>;

    /// Replays of a root job in any of the statuses.
    async fn get_by_job_id_and_status(&self, job_id: JobId, statuses: &[ReplayStatus]) -> Result<Vec<ReplaySpec>>;

    /// All replays of a project, newest first.
    async fn get_by_project_id(&self, project_id: ProjectId) -> Result<Vec<ReplaySpec>>;
}
