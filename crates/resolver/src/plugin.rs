//! Task and hook plugins.
//!
//! Plugins are registered once at startup into a [`PluginRegistry`] that is
//! handed to every component needing them. Task plugins know what a job
//! writes and reads; hook plugins only declare their default ordering.

use async_trait::async_trait;
use optimus_core::ProjectSpec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Error reported by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(pub String);

/// Inputs handed to a task plugin.
#[derive(Debug, Clone, Copy)]
pub struct PluginRequest<'a> {
    /// Task configuration of the job
    pub config: &'a BTreeMap<String, String>,
    /// Job assets
    pub assets: &'a BTreeMap<String, String>,
    /// Owning project
    pub project: &'a ProjectSpec,
}

/// Where a task writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Object name, e.g. `project:dataset.table`
    pub destination: String,
    /// Datastore kind, e.g. `bigquery`
    pub destination_type: String,
}

impl Destination {
    /// Create a destination.
    pub fn new(destination_type: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            destination_type: destination_type.into(),
        }
    }

    /// The `type://name` URN.
    pub fn urn(&self) -> String {
        format!("{}://{}", self.destination_type, self.destination)
    }
}

/// A task plugin able to infer a job's destination and upstream URNs.
#[async_trait]
pub trait TaskPlugin: Send + Sync {
    /// Plugin name, as referenced by `JobTask::plugin`.
    fn name(&self) -> &str;

    /// The object the task writes.
    async fn generate_destination(&self, request: PluginRequest<'_>) -> Result<Destination, PluginError>;

    /// URNs of the objects the task reads.
    async fn generate_dependencies(&self, request: PluginRequest<'_>) -> Result<Vec<String>, PluginError>;
}

/// A hook plugin.
pub trait HookPlugin: Send + Sync {
    /// Plugin name, as referenced by `JobHook::name`.
    fn name(&self) -> &str;

    /// Hooks this one runs after when the job does not say otherwise.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A registered plugin.
#[derive(Clone)]
pub enum Plugin {
    /// Runs a job's main task
    Task(Arc<dyn TaskPlugin>),
    /// Runs around a task
    Hook(Arc<dyn HookPlugin>),
}

impl Plugin {
    /// Plugin name.
    pub fn name(&self) -> &str {
        match self {
            Plugin::Task(plugin) => plugin.name(),
            Plugin::Hook(plugin) => plugin.name(),
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Plugin::Task(plugin) => write!(f, "Task({})", plugin.name()),
            Plugin::Hook(plugin) => write!(f, "Hook({})", plugin.name()),
        }
    }
}

/// Plugins by name.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Plugin>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, replacing one of the same name.
    pub fn register(&mut self, plugin: Plugin) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    /// Register a task plugin.
    pub fn with_task(mut self, plugin: Arc<dyn TaskPlugin>) -> Self {
        self.register(Plugin::Task(plugin));
        self
    }

    /// Register a hook plugin.
    pub fn with_hook(mut self, plugin: Arc<dyn HookPlugin>) -> Self {
        self.register(Plugin::Hook(plugin));
        self
    }

    /// Look up any plugin.
    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.plugins.get(name)
    }

    /// Look up a task plugin.
    pub fn get_task(&self, name: &str) -> Option<Arc<dyn TaskPlugin>> {
        match self.plugins.get(name) {
            Some(Plugin::Task(plugin)) => Some(plugin.clone()),
            _ => None,
        }
    }

    /// Look up a hook plugin.
    pub fn get_hook(&self, name: &str) -> Option<Arc<dyn HookPlugin>> {
        match self.plugins.get(name) {
            Some(Plugin::Hook(plugin)) => Some(plugin.clone()),
            _ => None,
        }
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Transporter;

    impl HookPlugin for Transporter {
        fn name(&self) -> &str {
            "transporter"
        }
    }

    struct Predator;

    impl HookPlugin for Predator {
        fn name(&self) -> &str {
            "predator"
        }

        fn depends_on(&self) -> Vec<String> {
            vec!["transporter".to_string()]
        }
    }

    #[test]
    fn test_registry_separates_kinds() {
        let registry = PluginRegistry::new()
            .with_hook(Arc::new(Transporter))
            .with_hook(Arc::new(Predator));

        assert_eq!(registry.len(), 2);
        assert!(registry.get_task("transporter").is_none());
        let predator = registry.get_hook("predator").unwrap();
        assert_eq!(predator.depends_on(), vec!["transporter".to_string()]);
        assert_eq!(format!("{:?}", registry.get("transporter").unwrap()), "Hook(transporter)");
    }

    #[test]
    fn test_destination_urn() {
        let destination = Destination::new("bigquery", "proj:dataset.table");
        assert_eq!(destination.urn(), "bigquery://proj:dataset.table");
    }
}
