//! Replays: re-execution of a job and its downstream for past dates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::id::ReplayId;
use crate::job::JobSpec;
use crate::project::{ProjectRef, ProjectSpec};
use crate::tree::MultiRootTree;
use crate::Time;

/// Allowed-namespace entry that admits every namespace.
pub const ALL_NAMESPACES: &str = "*";

/// Message type set when a replay could not be queued.
pub const MESSAGE_REQUEST_QUEUE_FULL: &str = "request queue is full";
/// Message type set when a forced replay cancels another one.
pub const MESSAGE_CONFLICTED_JOB_RUN: &str = "conflicted job run found";
/// Message type set when clearing runs in the scheduler failed.
pub const MESSAGE_CLEAR_RUN_FAILED: &str = "failed to clear scheduler runs";
/// Message set when a replayed run failed.
pub const MESSAGE_INSTANCE_RUN_FAILED: &str = "instance run failure found";
/// Message type set when a replay never left the queue in time.
pub const MESSAGE_RUNTIME_TIMEOUT: &str = "long running replay timeout";
/// Message set when every replayed run succeeded.
pub const MESSAGE_ALL_RUNS_SUCCEEDED: &str = "all instances for this replay are successfully run";

/// Lifecycle of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayStatus {
    /// Validated and persisted, waiting for a worker
    #[serde(rename = "Accepted")]
    Accepted,
    /// Runs are being cleared
    #[serde(rename = "In Progress")]
    InProgress,
    /// Runs cleared; waiting for the scheduler to finish them
    #[serde(rename = "Replayed")]
    Replayed,
    /// Every run succeeded
    #[serde(rename = "Success")]
    Success,
    /// A run or the replay itself failed
    #[serde(rename = "Failed")]
    Failed,
    /// Overridden by a forced replay
    #[serde(rename = "Cancelled")]
    Cancelled,
}

impl ReplayStatus {
    /// Statuses of replays that still hold their runs.
    pub const ACTIVE: [ReplayStatus; 3] = [
        ReplayStatus::Accepted,
        ReplayStatus::InProgress,
        ReplayStatus::Replayed,
    ];

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplayStatus::Success | ReplayStatus::Failed | ReplayStatus::Cancelled
        )
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayStatus::Accepted => write!(f, "Accepted"),
            ReplayStatus::InProgress => write!(f, "In Progress"),
            ReplayStatus::Replayed => write!(f, "Replayed"),
            ReplayStatus::Success => write!(f, "Success"),
            ReplayStatus::Failed => write!(f, "Failed"),
            ReplayStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::str::FromStr for ReplayStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Accepted" => Ok(ReplayStatus::Accepted),
            "In Progress" => Ok(ReplayStatus::InProgress),
            "Replayed" => Ok(ReplayStatus::Replayed),
            "Success" => Ok(ReplayStatus::Success),
            "Failed" => Ok(ReplayStatus::Failed),
            "Cancelled" => Ok(ReplayStatus::Cancelled),
            other => Err(format!("unknown replay status {other}")),
        }
    }
}

/// Reason attached to a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMessage {
    /// Category
    #[serde(rename = "type", default)]
    pub message_type: String,
    /// Human readable detail
    #[serde(default)]
    pub message: String,
}

impl ReplayMessage {
    /// Create a message.
    pub fn new(message_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            message: message.into(),
        }
    }
}

/// A persisted replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySpec {
    /// Unique identifier
    pub id: ReplayId,
    /// Root job
    pub job: JobSpec,
    /// Project of the root job
    pub project: ProjectRef,
    /// First day replayed
    pub start_date: Time,
    /// Last day replayed, inclusive
    pub end_date: Time,
    /// Current status
    pub status: ReplayStatus,
    /// Only the root job is replayed
    #[serde(default)]
    pub ignore_downstream: bool,
    /// Jobs and runs to re-execute
    pub execution_tree: MultiRootTree,
    /// Reason for the latest transition
    #[serde(default)]
    pub message: ReplayMessage,
    /// When accepted
    pub created_at: Time,
    /// Last transition
    pub updated_at: Time,
}

impl ReplaySpec {
    /// Whether two replays touch a common job at a common instant.
    pub fn overlaps(&self, tree: &MultiRootTree) -> bool {
        tree.nodes().any(|node| {
            self.execution_tree
                .get_node_by_name(&node.name)
                .is_some_and(|mine| !mine.runs.is_disjoint(&node.runs))
        })
    }
}

/// A replay as requested by a user.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    /// Root job
    pub job: JobSpec,
    /// First day to replay
    pub start: Time,
    /// Last day to replay, inclusive
    pub end: Time,
    /// Project of the root job
    pub project: ProjectSpec,
    /// Every job of the project keyed by name
    pub job_specs: HashMap<String, JobSpec>,
    /// Cancel conflicting replays instead of rejecting
    pub force: bool,
    /// Only replay the root job
    pub ignore_downstream: bool,
    /// Namespaces whose downstream jobs may be replayed; `*` admits all
    pub allowed_downstream_namespaces: Vec<String>,
}

impl ReplayRequest {
    /// A request over every job in `job_specs`, admitting all namespaces.
    pub fn new(
        job: JobSpec,
        start: Time,
        end: Time,
        project: ProjectSpec,
        job_specs: HashMap<String, JobSpec>,
    ) -> Self {
        Self {
            job,
            start,
            end,
            project,
            job_specs,
            force: false,
            ignore_downstream: false,
            allowed_downstream_namespaces: vec![ALL_NAMESPACES.to_string()],
        }
    }

    /// Set the force flag.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the ignore-downstream flag.
    pub fn with_ignore_downstream(mut self, ignore: bool) -> Self {
        self.ignore_downstream = ignore;
        self
    }

    /// Restrict downstream jobs to these namespaces.
    pub fn with_allowed_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.allowed_downstream_namespaces = namespaces;
        self
    }

    /// Whether jobs of `namespace` may be replayed.
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.allowed_downstream_namespaces
            .iter()
            .any(|ns| ns == ALL_NAMESPACES || ns == namespace)
    }
}

/// Result of planning a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPlan {
    /// Root job and the downstream jobs to replay, with their runs
    pub execution_tree: MultiRootTree,
    /// Downstream jobs left out because of namespace restrictions
    #[serde(default)]
    pub ignored_jobs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeNode;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_status_strings() {
        assert_eq!(ReplayStatus::InProgress.to_string(), "In Progress");
        assert_eq!("Replayed".parse::<ReplayStatus>().unwrap(), ReplayStatus::Replayed);
        assert!(ReplayStatus::ACTIVE.iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn test_allows_namespace() {
        let job = JobSpec::new("a", "t", NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        let now = Utc::now();
        let request = ReplayRequest::new(job, now, now, ProjectSpec::new("p"), HashMap::new());
        assert!(request.allows_namespace("anything"));

        let request = request.with_allowed_namespaces(vec!["ns-a".into()]);
        assert!(request.allows_namespace("ns-a"));
        assert!(!request.allows_namespace("ns-b"));
    }

    #[test]
    fn test_overlap_requires_shared_job_and_run() {
        let run = Utc.with_ymd_and_hms(2020, 8, 22, 2, 0, 0).unwrap();
        let mut mine = MultiRootTree::new();
        let mut node = TreeNode::new("r");
        node.runs.insert(run);
        mine.add_node(node);

        let spec = ReplaySpec {
            id: ReplayId::new(),
            job: JobSpec::new("r", "t", NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
            project: ProjectSpec::new("p").to_ref(),
            start_date: run,
            end_date: run,
            status: ReplayStatus::InProgress,
            ignore_downstream: false,
            execution_tree: mine,
            message: ReplayMessage::default(),
            created_at: run,
            updated_at: run,
        };

        let mut other = MultiRootTree::new();
        let mut node = TreeNode::new("r");
        node.runs.insert(run + chrono::Duration::days(1));
        other.add_node(node);
        assert!(!spec.overlaps(&other));

        let id = other.node_for("r");
        other.node_mut(id).runs.insert(run);
        assert!(spec.overlaps(&other));
    }
}
