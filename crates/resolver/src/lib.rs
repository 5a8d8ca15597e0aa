//! Dependency and priority resolution for Optimus.
//!
//! Turns a project's declared jobs into a resolved DAG: destinations and
//! upstream URNs are inferred through task plugins, static names are bound
//! to jobs on this control plane or on external ones, hooks are ordered and
//! every job receives a priority weight.

#![warn(missing_docs)]

pub mod error;
pub mod plugin;
pub mod resource_manager;
pub mod external;
pub mod dependency;
pub mod priority;

pub use error::{ResolveError, Result};
pub use plugin::{Destination, HookPlugin, Plugin, PluginError, PluginRegistry, PluginRequest, TaskPlugin};
pub use resource_manager::{OptimusResourceManager, ResourceManager};
pub use external::{ExternalDependencyResolver, ExternalResolution};
pub use dependency::{DependencyResolver, Resolution};
pub use priority::{PriorityResolver, MAX_PRIORITY_WEIGHT, MIN_PRIORITY_WEIGHT, PRIORITY_WEIGHT_GAP};
