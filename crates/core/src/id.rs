//! Unique identifiers for Optimus entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The nil identifier, used for entities that are not persisted yet.
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Whether this is the nil identifier.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Access the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a project.
    ProjectId
);

uuid_id!(
    /// Unique identifier for a namespace.
    NamespaceId
);

uuid_id!(
    /// Unique identifier for a job specification.
    JobId
);

uuid_id!(
    /// Unique identifier for a deployment request.
    DeploymentId
);

uuid_id!(
    /// Unique identifier for a replay request.
    ReplayId
);
