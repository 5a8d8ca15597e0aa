//! Resolution errors.

use optimus_core::ModelError;
use optimus_storage::StorageError;

/// Error type for resolution.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errors raised while resolving dependencies or priorities.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A static dependency without project names no job of the project
    #[error("unknown local dependency for job {dependency}: required by {job}")]
    UnknownLocalDependency {
        /// Declared dependency name
        dependency: String,
        /// Dependent job
        job: String,
    },

    /// Looking up a destination failed for a reason other than absence
    #[error("runtime dependency evaluation failed for {destination} of job {job}: {reason}")]
    UnknownRuntimeDependency {
        /// Upstream destination URN
        destination: String,
        /// Dependent job
        job: String,
        /// Underlying error
        reason: String,
    },

    /// An inferred upstream destination is claimed by no job anywhere
    #[error("could not find registered destination '{destination}' during compiling dependencies for the provided job {job}")]
    UndefinedDestination {
        /// Upstream destination URN
        destination: String,
        /// Dependent job
        job: String,
    },

    /// Static cross-project names not in `project/job` form
    #[error("invalid static dependency names for [{job}]: {names}")]
    InvalidStaticDependency {
        /// Dependent job
        job: String,
        /// Offending names, comma separated
        names: String,
    },

    /// A task plugin failed
    #[error("plugin {plugin} failed for job {job}: {reason}")]
    Plugin {
        /// Plugin name
        plugin: String,
        /// Job being resolved
        job: String,
        /// Plugin message
        reason: String,
    },

    /// A configured resource manager kind is unsupported
    #[error("resource manager [{0}] is not recognized")]
    UnknownResourceManager(String),

    /// A resource manager answered with a non-success status
    #[error("resource manager {name} returned {status}: {body}")]
    ResourceManager {
        /// Resource manager name
        name: String,
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// Transport or decoding failure talking to a resource manager
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Model error, including cycles
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Repository error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ResolveError {
    /// Whether the error is a cycle in the job graph.
    pub fn is_cycle(&self) -> bool {
        matches!(self, ResolveError::Model(ModelError::CyclicDependency { .. }))
    }
}
