//! Progress notifications emitted while resolving and deploying jobs.

use std::fmt;

/// Receives progress events.
pub trait Observer: Send + Sync {
    /// Handle one event.
    fn notify(&self, event: ProgressEvent);
}

/// Something worth reporting to whoever started an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// An inferred or static dependency could not be resolved locally
    UnknownDependencyUsed {
        /// Dependent job
        job: String,
        /// Dependency name or URN
        dependency: String,
    },
    /// A job's dependencies were resolved
    DependencyResolved {
        /// Job name
        job: String,
    },
    /// A hook names a dependency that does not run before it
    HookDependencyUnresolved {
        /// Job name
        job: String,
        /// Hook name
        hook: String,
        /// The unresolved name
        depends_on: String,
    },
    /// A job could not be given a computed priority
    PriorityWeightAssignmentFailed {
        /// Job name
        job: String,
        /// Why
        reason: String,
    },
    /// A job was uploaded to the scheduler
    JobUploaded {
        /// Job name
        job: String,
    },
    /// A job failed to upload
    JobUploadFailed {
        /// Job name
        job: String,
        /// Error text
        reason: String,
    },
    /// Scheduler jobs no longer declared were removed
    JobsCleaned {
        /// Namespace
        namespace: String,
        /// Removed job names
        jobs: Vec<String>,
    },
    /// A namespace finished deploying
    NamespaceDeployed {
        /// Namespace
        namespace: String,
        /// Jobs uploaded
        success_count: usize,
        /// Jobs that failed
        failure_count: usize,
    },
}

impl ProgressEvent {
    /// Whether the event reports a problem.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ProgressEvent::UnknownDependencyUsed { .. }
                | ProgressEvent::HookDependencyUnresolved { .. }
                | ProgressEvent::PriorityWeightAssignmentFailed { .. }
                | ProgressEvent::JobUploadFailed { .. }
        )
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::UnknownDependencyUsed { job, dependency } => {
                write!(f, "could not find registered destination '{dependency}' during compiling dependencies for the provided job {job}")
            }
            ProgressEvent::DependencyResolved { job } => {
                write!(f, "dependencies resolved for job {job}")
            }
            ProgressEvent::HookDependencyUnresolved { job, hook, depends_on } => {
                write!(f, "hook {hook} of job {job} depends on unknown hook {depends_on}")
            }
            ProgressEvent::PriorityWeightAssignmentFailed { job, reason } => {
                write!(f, "failed to assign priority weight for job {job}: {reason}")
            }
            ProgressEvent::JobUploaded { job } => write!(f, "uploaded job {job}"),
            ProgressEvent::JobUploadFailed { job, reason } => {
                write!(f, "failed to upload job {job}: {reason}")
            }
            ProgressEvent::JobsCleaned { namespace, jobs } => {
                write!(f, "deleted {} jobs from namespace {namespace}", jobs.len())
            }
            ProgressEvent::NamespaceDeployed {
                namespace,
                success_count,
                failure_count,
            } => write!(
                f,
                "namespace {namespace} deployed: {success_count} succeeded, {failure_count} failed"
            ),
        }
    }
}

/// Notify `observer` if there is one.
pub fn notify(observer: Option<&dyn Observer>, event: ProgressEvent) {
    if let Some(observer) = observer {
        observer.notify(event);
    }
}
