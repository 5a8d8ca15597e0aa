//! Storage abstraction and implementations for Optimus.
//!
//! This crate provides one repository trait per aggregate, an in-memory
//! implementation of all of them and, behind the `sqlite` feature, a SQLite
//! backend for the durable queues.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{
    JobDependencyRepository, JobDeploymentRepository, JobSpecRepository, NamespaceRepository,
    ProjectJobPair, ProjectRepository, ReplaySpecRepository, Result, StorageError,
    UnknownJobDependencyRepository,
};
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
