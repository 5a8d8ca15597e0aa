//! Errors raised while validating or evaluating models.

/// Error type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Text carried by every cycle error.
pub const CYCLE_DEPENDENCY_MESSAGE: &str = "a cycle dependency encountered in the tree";

/// Errors that can occur while working with models.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// A duration string could not be parsed
    #[error("invalid duration \"{0}\"")]
    InvalidDuration(String),

    /// A window failed validation
    #[error("{0}")]
    InvalidWindow(String),

    /// A cron expression could not be parsed
    #[error("invalid cron expression \"{expr}\": {reason}")]
    InvalidCron {
        /// The rejected expression
        expr: String,
        /// Parser message
        reason: String,
    },

    /// A schedule has no fire time after the requested instant
    #[error("schedule \"{0}\" has no upcoming run")]
    ScheduleExhausted(String),

    /// A job schedule is inconsistent
    #[error("invalid schedule for job {job}: {reason}")]
    InvalidSchedule {
        /// Job name
        job: String,
        /// What is wrong
        reason: String,
    },

    /// A hook dependency graph is invalid
    #[error("invalid hook {hook} for job {job}: {reason}")]
    InvalidHook {
        /// Job name
        job: String,
        /// Hook name
        hook: String,
        /// What is wrong
        reason: String,
    },

    /// The dependency tree contains a cycle
    #[error("{node}: a cycle dependency encountered in the tree\n{chain}")]
    CyclicDependency {
        /// Node at which the back edge was found
        node: String,
        /// Rendered path of the cycle
        chain: String,
    },

    /// A persisted tree refers to a node it does not contain
    #[error("tree node not found: {0}")]
    NodeNotFound(String),
}
