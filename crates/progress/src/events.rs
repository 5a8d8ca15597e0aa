//! Lifecycle events.

use optimus_core::{DeploymentId, DeploymentStatus, ProjectRef, ReplayId};
use serde::Serialize;

/// Every event carried by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum Event {
    /// Deployment lifecycle
    Deployment(DeploymentEvent),
    /// Replay lifecycle
    Replay(ReplayEvent),
}

/// Deployment lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// A deployment reached a terminal status
    Finished {
        /// Deployment
        id: DeploymentId,
        /// Project deployed
        project: ProjectRef,
        /// Final status
        status: DeploymentStatus,
    },
}

/// Replay lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayEvent {
    /// Runs were cleared; the scheduler will re-execute them
    Prepared(ReplayId),
    /// Runs could not be cleared
    FailedToPrepare(ReplayId),
}

impl From<DeploymentEvent> for Event {
    fn from(event: DeploymentEvent) -> Self {
        Event::Deployment(event)
    }
}

impl From<ReplayEvent> for Event {
    fn from(event: ReplayEvent) -> Self {
        Event::Replay(event)
    }
}
