//! Priority weights.
//!
//! Jobs nearer the top of the dependency graph run first. A job's weight
//! drops by [`PRIORITY_WEIGHT_GAP`] for every level of its longest upstream
//! chain inside the project, never going under [`MIN_PRIORITY_WEIGHT`].

use optimus_core::{
    progress::notify, DependencyType, JobSpec, MultiRootTree, NodeId, Observer, ProgressEvent,
    TreeNode,
};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::error::Result;

/// Lowest weight a job can get.
pub const MIN_PRIORITY_WEIGHT: i64 = 1;

/// Weight of a job with no upstream in the project.
pub const MAX_PRIORITY_WEIGHT: i64 = 10000;

/// Weight lost per level of depth.
pub const PRIORITY_WEIGHT_GAP: i64 = 10;

/// Assigns `task.priority` from the dependency graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityResolver;

impl PriorityResolver {
    /// Create a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Set the priority of every job.
    ///
    /// Dependencies must already be resolved. Fails when the jobs form a
    /// cycle.
    pub fn resolve(&self, mut jobs: Vec<JobSpec>, observer: Option<&dyn Observer>) -> Result<Vec<JobSpec>> {
        let tree = build_tree(&jobs, observer);
        tree.is_cyclic()?;

        let depths = longest_depths(&tree);
        for job in jobs.iter_mut() {
            let depth = tree.node_id(&job.name).and_then(|id| depths.get(&id).copied());
            match depth {
                Some(depth) => job.task.priority = weight_for_depth(depth),
                None => {
                    warn!("no priority weight computed for job {}", job.name);
                    notify(
                        observer,
                        ProgressEvent::PriorityWeightAssignmentFailed {
                            job: job.name.clone(),
                            reason: "job is not reachable from any root".to_string(),
                        },
                    );
                    job.task.priority = MIN_PRIORITY_WEIGHT;
                }
            }
        }
        debug!("assigned priority weights to {} jobs", jobs.len());
        Ok(jobs)
    }
}

/// Weight of a job `depth` levels below a root.
pub fn weight_for_depth(depth: usize) -> i64 {
    let depth = i64::try_from(depth).unwrap_or(i64::MAX / PRIORITY_WEIGHT_GAP);
    MAX_PRIORITY_WEIGHT
        .saturating_sub(depth.saturating_mul(PRIORITY_WEIGHT_GAP))
        .max(MIN_PRIORITY_WEIGHT)
}

fn build_tree(jobs: &[JobSpec], observer: Option<&dyn Observer>) -> MultiRootTree {
    let mut tree = MultiRootTree::new();
    for job in jobs {
        tree.add_node_if_not_exist(TreeNode::new(job.name.clone()));
    }

    for job in jobs {
        let child = tree.node_for(&job.name);
        let mut parents: Vec<String> = Vec::new();

        for (key, dependency) in &job.dependencies {
            match (dependency.dependency_type, &dependency.job) {
                (DependencyType::Intra, Some(upstream)) => {
                    if tree.node_id(&upstream.name).is_none() {
                        notify(
                            observer,
                            ProgressEvent::PriorityWeightAssignmentFailed {
                                job: job.name.clone(),
                                reason: format!("dependency {} is not part of the project", upstream.name),
                            },
                        );
                        tree.mark_root(&upstream.name);
                    }
                    parents.push(upstream.name.clone());
                }
                _ => {
                    // upstream outside the project
                    tree.mark_root(key);
                    parents.push(key.clone());
                }
            }
        }
        for external in &job.external_dependencies.optimus_dependencies {
            let name = format!("{}/{}", external.project_name, external.job_name);
            tree.mark_root(&name);
            parents.push(name);
        }

        if parents.is_empty() {
            tree.mark_root(&job.name);
        }
        for name in parents {
            let parent = tree.node_for(&name);
            tree.add_dependent(parent, child);
        }
    }
    tree
}

/// Longest distance from any node without parents, by Kahn's algorithm.
///
/// Nodes on a cycle never reach indegree zero and get no depth.
fn longest_depths(tree: &MultiRootTree) -> HashMap<NodeId, usize> {
    let mut indegree: HashMap<NodeId, usize> = tree.node_ids().map(|id| (id, 0)).collect();
    for id in tree.node_ids() {
        for child in &tree.node(id).dependents {
            *indegree.entry(*child).or_default() += 1;
        }
    }

    let mut depths: HashMap<NodeId, usize> = HashMap::new();
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    for (id, degree) in &indegree {
        if *degree == 0 {
            depths.insert(*id, 0);
            queue.push_back(*id);
        }
    }

    while let Some(id) = queue.pop_front() {
        let depth = depths.get(&id).copied().unwrap_or(0);
        for child in &tree.node(id).dependents {
            let entry = depths.entry(*child).or_insert(0);
            *entry = (*entry).max(depth + 1);
            if let Some(degree) = indegree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }
    depths
}
