//! Deployment requests and their outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::DeploymentId;
use crate::job::UnknownDependency;
use crate::project::ProjectRef;
use crate::Time;

/// Lifecycle of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentStatus {
    /// Waiting for a worker
    #[serde(rename = "In Queue")]
    InQueue,
    /// Being deployed
    #[serde(rename = "In Progress")]
    InProgress,
    /// Finished without failures
    #[serde(rename = "Succeed")]
    Succeed,
    /// Finished with failures
    #[serde(rename = "Failed")]
    Failed,
    /// Abandoned after the worker deadline
    #[serde(rename = "Cancelled")]
    Cancelled,
}

impl DeploymentStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeed | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::InQueue => write!(f, "In Queue"),
            DeploymentStatus::InProgress => write!(f, "In Progress"),
            DeploymentStatus::Succeed => write!(f, "Succeed"),
            DeploymentStatus::Failed => write!(f, "Failed"),
            DeploymentStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In Queue" => Ok(DeploymentStatus::InQueue),
            "In Progress" => Ok(DeploymentStatus::InProgress),
            "Succeed" => Ok(DeploymentStatus::Succeed),
            "Failed" => Ok(DeploymentStatus::Failed),
            "Cancelled" => Ok(DeploymentStatus::Cancelled),
            other => Err(format!("unknown deployment status {other}")),
        }
    }
}

/// A job that failed to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDeploymentFailure {
    /// Job name; empty when the whole namespace failed
    pub job_name: String,
    /// Error text
    pub message: String,
}

/// Outcome of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDeploymentDetail {
    /// Jobs uploaded
    pub success_count: usize,
    /// Jobs that failed
    pub failure_count: usize,
    /// Failure details
    #[serde(default)]
    pub failures: Vec<JobDeploymentFailure>,
    /// Static dependencies that resolved nowhere
    #[serde(default)]
    pub unknown_dependencies: Vec<UnknownDependency>,
}

impl JobDeploymentDetail {
    /// Fold another detail into this one.
    pub fn merge(&mut self, other: JobDeploymentDetail) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.failures.extend(other.failures);
        self.unknown_dependencies.extend(other.unknown_dependencies);
    }

    /// Record a failure.
    pub fn add_failure(&mut self, job_name: impl Into<String>, message: impl Into<String>) {
        self.failure_count += 1;
        self.failures.push(JobDeploymentFailure {
            job_name: job_name.into(),
            message: message.into(),
        });
    }
}

/// A deployment request for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDeployment {
    /// Unique identifier
    pub id: DeploymentId,
    /// Project being deployed
    pub project: ProjectRef,
    /// Current status
    pub status: DeploymentStatus,
    /// Outcome, filled when finished
    #[serde(default)]
    pub details: JobDeploymentDetail,
    /// When requested
    pub created_at: Time,
    /// Last transition
    pub updated_at: Time,
}

impl JobDeployment {
    /// A new queued request.
    pub fn queued(project: ProjectRef) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: DeploymentId::new(),
            project,
            status: DeploymentStatus::InQueue,
            details: JobDeploymentDetail::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
