//! Projects and namespaces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{NamespaceId, ProjectId};

/// A tenant of the control plane. Unique by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    /// Unique identifier
    #[serde(default)]
    pub id: ProjectId,

    /// Project name
    pub name: String,

    /// Free-form configuration
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl ProjectSpec {
    /// Create a project with a fresh id and no config.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.into(),
            config: BTreeMap::new(),
        }
    }

    /// Add a configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// A reference to this project.
    pub fn to_ref(&self) -> ProjectRef {
        ProjectRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// A group of jobs owned by one team. Unique by name within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    /// Unique identifier
    #[serde(default)]
    pub id: NamespaceId,

    /// Namespace name
    pub name: String,

    /// Owning project
    pub project: ProjectRef,

    /// Free-form configuration
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl NamespaceSpec {
    /// Create a namespace in a project.
    pub fn new(name: impl Into<String>, project: &ProjectSpec) -> Self {
        Self {
            id: NamespaceId::new(),
            name: name.into(),
            project: project.to_ref(),
            config: BTreeMap::new(),
        }
    }
}

/// Lightweight pointer to a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Project id; nil for projects managed by another control plane
    #[serde(default = "ProjectId::nil")]
    pub id: ProjectId,

    /// Project name
    pub name: String,
}

impl ProjectRef {
    /// Reference a project that is not stored locally.
    pub fn external(name: impl Into<String>) -> Self {
        Self {
            id: ProjectId::nil(),
            name: name.into(),
        }
    }
}
