//! Deployment errors.

use optimus_core::{JobDeploymentDetail, SchedulerError};
use optimus_resolver::ResolveError;
use optimus_storage::StorageError;
use std::time::Duration;

/// Error type for deployments.
pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors raised while deploying a project.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Dependency or priority resolution failed
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Repository error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The scheduler rejected a namespace
    #[error("failed to deploy namespace {namespace}: {source}")]
    Scheduler {
        /// Namespace name
        namespace: String,
        /// Scheduler error
        source: SchedulerError,
    },

    /// Some namespaces failed; the others were deployed
    #[error("{}", join_errors(.errors))]
    Namespaces {
        /// One error per failed step
        errors: Vec<DeployError>,
        /// Outcome of the namespaces that went through
        detail: JobDeploymentDetail,
    },

    /// Too many deployments are waiting
    #[error("request queue is full")]
    RequestQueueFull,

    /// The manager no longer accepts work
    #[error("deploy manager is closed")]
    Closed,

    /// A worker gave up on a deployment
    #[error("deployment timed out after {0:?}")]
    Timeout(Duration),
}

fn join_errors(errors: &[DeployError]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| format!("* {e}")).collect();
    format!("{} errors occurred:\n\t{}", errors.len(), messages.join("\n\t"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_errors_are_joined() {
        let err = DeployError::Namespaces {
            errors: vec![
                DeployError::Scheduler {
                    namespace: "ns-a".to_string(),
                    source: SchedulerError::Request("unavailable".to_string()),
                },
                DeployError::Storage(StorageError::NotFound("namespace ns-b".to_string())),
            ],
            detail: JobDeploymentDetail::default(),
        };

        let text = err.to_string();
        assert!(text.starts_with("2 errors occurred"));
        assert!(text.contains("failed to deploy namespace ns-a"));
        assert!(text.contains("not found: namespace ns-b"));
    }
}
