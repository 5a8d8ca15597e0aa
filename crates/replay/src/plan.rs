//! Replay planning.
//!
//! A plan is the root job plus every downstream job reachable from it, each
//! annotated with the scheduled instants to clear. A child inherits runs
//! from each parent run whose output its window reads: for a parent run `p`
//! the child's fires in `[p, p + window size - 24h]` are replayed.

use chrono::Duration;
use optimus_core::{
    CronSchedule, DependencyType, JobSpec, MultiRootTree, NodeId, ReplayPlan, ReplayRequest, Time,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::error::{ReplayError, Result};

/// Fires of `schedule` from `start` through the end of the day of `end`.
///
/// `end` is inclusive: every fire before the first fire at or after
/// `end + 1 day` is returned.
pub fn get_runs_between_dates(start: Time, end: Time, schedule: &CronSchedule) -> Result<Vec<Time>> {
    let end_of_day = end + Duration::days(1);
    let mut run_end = schedule.next(end)?;
    while run_end < end_of_day {
        run_end = schedule.next(run_end)?;
    }

    let mut runs = Vec::new();
    let mut run = schedule.next(start - Duration::seconds(1))?;
    while run < run_end {
        runs.push(run);
        run = schedule.next(run)?;
    }
    Ok(runs)
}

/// Builds execution trees for replay requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayTreeBuilder;

impl ReplayTreeBuilder {
    /// Create a builder.
    pub fn new() -> Self {
        Self
    }

    /// Plan the runs a request re-executes.
    pub fn plan(&self, request: &ReplayRequest) -> Result<ReplayPlan> {
        if request.start > request.end {
            return Err(ReplayError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }

        let root = request
            .job_specs
            .get(&request.job.name)
            .ok_or_else(|| ReplayError::JobNotFound(request.job.name.clone()))?;
        let root_runs = get_runs_between_dates(request.start, request.end, &root.cron_schedule()?)?;

        if request.ignore_downstream {
            let mut tree = MultiRootTree::new();
            let id = tree.node_for(&root.name);
            tree.node_mut(id).runs = root_runs.into_iter().collect();
            tree.mark_root(&root.name);
            return Ok(ReplayPlan {
                execution_tree: tree,
                ignored_jobs: Vec::new(),
            });
        }

        let dag = build_dag(&request.job_specs)?;
        dag.is_cyclic()?;
        let root_id = dag
            .node_id(&root.name)
            .ok_or_else(|| ReplayError::JobNotFound(root.name.clone()))?;
        let downstream = dag.subtree(root_id);

        let (mut tree, ignored_jobs) = filter_namespaces(&downstream, request);
        let tree_root = tree.node_for(&root.name);
        tree.node_mut(tree_root).runs = root_runs.into_iter().collect();
        populate_downstream_runs(&mut tree, tree_root, &request.job_specs)?;

        debug!(
            "planned replay of {} over {} jobs, {} ignored",
            root.name,
            tree.len(),
            ignored_jobs.len()
        );
        Ok(ReplayPlan {
            execution_tree: tree,
            ignored_jobs,
        })
    }
}

/// Graph of every job in the project, edges pointing downstream.
///
/// Upstreams outside the project become extra roots. A missing intra-project
/// upstream is an error.
fn build_dag(job_specs: &HashMap<String, JobSpec>) -> Result<MultiRootTree> {
    let mut names: Vec<&String> = job_specs.keys().collect();
    names.sort();

    let mut tree = MultiRootTree::new();
    for name in &names {
        tree.node_for(name);
    }

    for name in names {
        let spec = &job_specs[name];
        let child = tree.node_for(&spec.name);
        if spec.dependencies.is_empty() {
            tree.mark_root(&spec.name);
        }

        for (key, dependency) in &spec.dependencies {
            let parent_name = match (dependency.dependency_type, &dependency.job) {
                (DependencyType::Intra, Some(upstream)) => {
                    if !job_specs.contains_key(&upstream.name) {
                        return Err(ReplayError::UpstreamNotFound(upstream.name.clone()));
                    }
                    upstream.name.clone()
                }
                _ => {
                    tree.mark_root(key);
                    key.clone()
                }
            };
            let parent = tree.node_for(&parent_name);
            tree.add_dependent(parent, child);
        }
    }
    Ok(tree)
}

/// Drop dependents of disallowed namespaces together with everything only
/// reachable through them.
fn filter_namespaces(downstream: &MultiRootTree, request: &ReplayRequest) -> (MultiRootTree, Vec<String>) {
    let allowed = |id: NodeId| {
        let name = &downstream.node(id).name;
        request
            .job_specs
            .get(name)
            .is_some_and(|spec| request.allows_namespace(&spec.namespace))
    };

    let root = downstream.root_ids();
    let mut kept: HashSet<NodeId> = root.iter().copied().collect();
    let mut queue: VecDeque<NodeId> = root.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        for &child in &downstream.node(id).dependents {
            if !kept.contains(&child) && allowed(child) {
                kept.insert(child);
                queue.push_back(child);
            }
        }
    }

    let mut tree = MultiRootTree::new();
    let mut ignored = Vec::new();
    for id in downstream.node_ids() {
        let node = downstream.node(id);
        if !kept.contains(&id) {
            ignored.push(node.name.clone());
            continue;
        }
        let parent = tree.node_for(&node.name);
        for &child in &node.dependents {
            if kept.contains(&child) {
                let child = tree.node_for(&downstream.node(child).name);
                tree.add_dependent(parent, child);
            }
        }
    }
    for name in downstream.root_names() {
        tree.mark_root(name);
    }
    ignored.sort();
    (tree, ignored)
}

/// Fill the runs of every dependent of `root`, parents before children.
fn populate_downstream_runs(
    tree: &mut MultiRootTree,
    root: NodeId,
    job_specs: &HashMap<String, JobSpec>,
) -> Result<()> {
    for parent in tree.topological_from(root) {
        let parent_runs: Vec<Time> = tree.node(parent).runs.iter().copied().collect();
        let dependents = tree.node(parent).dependents.clone();

        for child in dependents {
            let name = tree.node(child).name.clone();
            let spec = job_specs
                .get(&name)
                .ok_or_else(|| ReplayError::JobNotFound(name.clone()))?;
            let runs = child_runs(spec, &parent_runs)?;
            tree.node_mut(child).runs.extend(runs);
        }
    }
    Ok(())
}

fn child_runs(child: &JobSpec, parent_runs: &[Time]) -> Result<BTreeSet<Time>> {
    let schedule = child.cron_schedule()?;
    let start_date = child.schedule.start_time();

    let mut runs = BTreeSet::new();
    for &parent_run in parent_runs {
        let window = child.task.window.get_time_range(parent_run)?;
        let parent_end = parent_run - Duration::hours(24) + window.size();

        let first_affected = schedule.next(parent_run - Duration::seconds(1))?;
        if first_affected < start_date {
            continue;
        }
        runs.extend(get_runs_between_dates(parent_run, parent_end, &schedule)?);
    }
    Ok(runs)
}
