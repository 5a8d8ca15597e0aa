//! Datastore resources (tables, datasets, views).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a datastore resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Table
    Table,
    /// Dataset
    Dataset,
    /// View
    View,
    /// External table
    ExternalTable,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Table => write!(f, "table"),
            ResourceType::Dataset => write!(f, "dataset"),
            ResourceType::View => write!(f, "view"),
            ResourceType::ExternalTable => write!(f, "external_table"),
        }
    }
}

/// A storage object declared by a user.
///
/// Equality compares version, name, type, spec, assets and labels; the id,
/// URN and datastore are derived and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Unique identifier
    #[serde(default)]
    pub id: uuid::Uuid,
    /// Spec version
    #[serde(default)]
    pub version: u32,
    /// Fully qualified name in the datastore
    pub name: String,
    /// Kind
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Owning datastore, such as `bigquery`
    pub datastore: String,
    /// Stable URN
    #[serde(default)]
    pub urn: String,
    /// Datastore specific definition
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Asset files
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// Derive the URN from the datastore and name.
    pub fn generate_urn(&self) -> String {
        format!("{}://{}", self.datastore, self.name)
    }

    /// Fill the URN if it is not set.
    pub fn with_urn(mut self) -> Self {
        if self.urn.is_empty() {
            self.urn = self.generate_urn();
        }
        self
    }
}

impl PartialEq for ResourceSpec {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.name == other.name
            && self.resource_type == other.resource_type
            && self.spec == other.spec
            && self.assets == other.assets
            && self.labels == other.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> ResourceSpec {
        ResourceSpec {
            id: uuid::Uuid::new_v4(),
            version: 1,
            name: name.to_string(),
            resource_type: ResourceType::Table,
            datastore: "bigquery".to_string(),
            urn: String::new(),
            spec: serde_json::json!({"schema": [{"name": "id", "type": "INTEGER"}]}),
            assets: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_equality_ignores_identity() {
        let a = table("proj.dataset.table").with_urn();
        let mut b = table("proj.dataset.table");
        b.datastore = "other".to_string();
        assert_eq!(a, b);
        assert_eq!(a.urn, "bigquery://proj.dataset.table");
    }

    #[test]
    fn test_equality_compares_spec_and_labels() {
        let a = table("t");
        let mut b = table("t");
        b.labels.insert("owner".into(), "team-a".into());
        assert_ne!(a, b);

        let mut c = table("t");
        c.spec = serde_json::json!({});
        assert_ne!(a, c);
    }
}
