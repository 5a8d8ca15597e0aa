//! Admission checks for replay requests.

use chrono::Duration;
use optimus_core::{
    JobRunState, MultiRootTree, ReplayId, ReplayMessage, ReplayRequest, ReplayStatus, Scheduler,
    MESSAGE_CONFLICTED_JOB_RUN,
};
use optimus_storage::ReplaySpecRepository;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ReplayError, Result};

/// Page size for scheduler run status queries.
pub const RUN_STATUS_BATCH_SIZE: usize = 100;

/// Rejects replays that would clear runs someone else is using.
#[derive(Clone)]
pub struct ReplayValidator {
    scheduler: Arc<dyn Scheduler>,
}

impl ReplayValidator {
    /// Create a validator.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Check a planned replay.
    ///
    /// Without `force`, a run that is executing in the scheduler or held by
    /// another active replay fails with [`ReplayError::ConflictedJobRun`].
    /// With `force`, active replays of the same job are cancelled in favour of
    /// replay `id` instead.
    pub async fn validate(
        &self,
        repo: &dyn ReplaySpecRepository,
        request: &ReplayRequest,
        tree: &MultiRootTree,
        id: ReplayId,
    ) -> Result<()> {
        if request.force {
            return self.cancel_conflicting_replays(repo, request, id).await;
        }

        self.validate_running_instances(request, tree).await?;

        let active = repo.get_by_status(&ReplayStatus::ACTIVE).await?;
        if let Some(conflict) = active.iter().find(|replay| replay.overlaps(tree)) {
            warn!("replay of {} conflicts with active replay {}", request.job.name, conflict.id);
            return Err(ReplayError::ConflictedJobRun);
        }
        Ok(())
    }

    async fn validate_running_instances(&self, request: &ReplayRequest, tree: &MultiRootTree) -> Result<()> {
        let end = request.end + Duration::days(1) - Duration::seconds(1);
        for node in tree.nodes() {
            let statuses = self
                .scheduler
                .get_job_run_status(&request.project, &node.name, request.start, end, RUN_STATUS_BATCH_SIZE)
                .await?;
            let busy = statuses.iter().find(|status| {
                matches!(status.state, JobRunState::Running | JobRunState::Queued)
                    && node.runs.contains(&status.scheduled_at)
            });
            if let Some(status) = busy {
                warn!("run {} of job {} is {}", status.scheduled_at, node.name, status.state);
                return Err(ReplayError::ConflictedJobRun);
            }
        }
        Ok(())
    }

    async fn cancel_conflicting_replays(
        &self,
        repo: &dyn ReplaySpecRepository,
        request: &ReplayRequest,
        id: ReplayId,
    ) -> Result<()> {
        let active = repo
            .get_by_job_id_and_status(request.job.id, &ReplayStatus::ACTIVE)
            .await?;
        for replay in active {
            let message = ReplayMessage::new(
                MESSAGE_CONFLICTED_JOB_RUN,
                format!("force started replay with ID: {id}"),
            );
            repo.update_status(replay.id, ReplayStatus::Cancelled, message).await?;
            info!("replay {} cancelled by forced replay {}", replay.id, id);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plan::tests::{at, create_test_job, create_test_request};
    use crate::plan::ReplayTreeBuilder;
    use async_trait::async_trait;
    use optimus_core::{
        JobDeploymentDetail, JobSpec, JobStatus, NamespaceSpec, Observer, ProjectSpec, ReplaySpec,
        SchedulerError, SchedulerResult, Time,
    };
    use optimus_storage::MemoryStore;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Scheduler that reports canned run states and records clears.
    #[derive(Default)]
    pub(crate) struct FakeScheduler {
        pub statuses: Mutex<HashMap<String, Vec<JobStatus>>>,
        pub cleared: Mutex<Vec<(String, Time, Time)>>,
        pub failing_job: Option<String>,
    }

    impl FakeScheduler {
        pub(crate) async fn set_statuses(&self, job: &str, statuses: Vec<JobStatus>) {
            self.statuses.lock().await.insert(job.to_string(), statuses);
        }
    }

    #[async_trait]
    impl Scheduler for FakeScheduler {
        async fn deploy_jobs(
            &self,
            _namespace: &NamespaceSpec,
            _jobs: &[JobSpec],
            _observer: Option<&dyn Observer>,
        ) -> SchedulerResult<JobDeploymentDetail> {
            Ok(JobDeploymentDetail::default())
        }

        async fn list_jobs(&self, _namespace: &NamespaceSpec) -> SchedulerResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn delete_jobs(
            &self,
            _namespace: &NamespaceSpec,
            _job_names: &[String],
            _observer: Option<&dyn Observer>,
        ) -> SchedulerResult<()> {
            Ok(())
        }

        async fn get_job_run_status(
            &self,
            _project: &ProjectSpec,
            job_name: &str,
            start: Time,
            end: Time,
            _batch_size: usize,
        ) -> SchedulerResult<Vec<JobStatus>> {
            if self.failing_job.as_deref() == Some(job_name) {
                return Err(SchedulerError::Request("run status unavailable".to_string()));
            }
            let statuses = self.statuses.lock().await;
            Ok(statuses
                .get(job_name)
                .map(|all| {
                    all.iter()
                        .filter(|s| s.scheduled_at >= start && s.scheduled_at <= end)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn clear(&self, _project: &ProjectSpec, job_name: &str, start: Time, end: Time) -> SchedulerResult<()> {
            if self.failing_job.as_deref() == Some(job_name) {
                return Err(SchedulerError::Request("clear rejected".to_string()));
            }
            self.cleared.lock().await.push((job_name.to_string(), start, end));
            Ok(())
        }
    }

    pub(crate) fn create_test_spec(request: &ReplayRequest, tree: MultiRootTree, status: ReplayStatus) -> ReplaySpec {
        let now = chrono::Utc::now();
        ReplaySpec {
            id: ReplayId::new(),
            job: request.job.clone(),
            project: request.project.to_ref(),
            start_date: request.start,
            end_date: request.end,
            status,
            ignore_downstream: request.ignore_downstream,
            execution_tree: tree,
            message: ReplayMessage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn create_conflict_request() -> ReplayRequest {
        let project = ProjectSpec::new("project-name");
        create_test_request(
            "job-name",
            at(2020, 8, 22, 0),
            at(2020, 8, 26, 0),
            &project,
            vec![create_test_job("job-name", "ns"), create_test_job("job-name-2", "ns")],
        )
    }

    #[tokio::test]
    async fn test_running_instance_conflicts() {
        let request = create_conflict_request();
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();
        let scheduler = Arc::new(FakeScheduler::default());
        scheduler
            .set_statuses(
                "job-name",
                vec![
                    JobStatus::new(at(2020, 8, 22, 2), JobRunState::Success),
                    JobStatus::new(at(2020, 8, 23, 2), JobRunState::Running),
                ],
            )
            .await;
        let store = MemoryStore::new();

        let err = ReplayValidator::new(scheduler)
            .validate(&store, &request, &plan.execution_tree, ReplayId::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReplayError::ConflictedJobRun));
        assert_eq!(err.to_string(), "conflicted job run found");
    }

    #[tokio::test]
    async fn test_running_instance_outside_plan_is_fine() {
        let request = create_conflict_request();
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();
        let scheduler = Arc::new(FakeScheduler::default());
        scheduler
            .set_statuses("job-name", vec![JobStatus::new(at(2020, 8, 30, 2), JobRunState::Running)])
            .await;
        let store = MemoryStore::new();

        ReplayValidator::new(scheduler)
            .validate(&store, &request, &plan.execution_tree, ReplayId::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_active_replay_conflicts() {
        let request = create_conflict_request();
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();
        let store = MemoryStore::new();
        let active = create_test_spec(&request, plan.execution_tree.clone(), ReplayStatus::InProgress);
        store.insert(&active).await.unwrap();

        let err = ReplayValidator::new(Arc::new(FakeScheduler::default()))
            .validate(&store, &request, &plan.execution_tree, ReplayId::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReplayError::ConflictedJobRun));
    }

    #[tokio::test]
    async fn test_force_cancels_active_replays() {
        let request = create_conflict_request().with_force(true);
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();
        let store = MemoryStore::new();
        let active = create_test_spec(&request, plan.execution_tree.clone(), ReplayStatus::InProgress);
        store.insert(&active).await.unwrap();
        let finished = create_test_spec(&request, plan.execution_tree.clone(), ReplayStatus::Success);
        store.insert(&finished).await.unwrap();

        let id = ReplayId::new();
        ReplayValidator::new(Arc::new(FakeScheduler::default()))
            .validate(&store, &request, &plan.execution_tree, id)
            .await
            .unwrap();

        let cancelled = store.get_by_id(active.id).await.unwrap();
        assert_eq!(cancelled.status, ReplayStatus::Cancelled);
        assert_eq!(
            cancelled.message,
            ReplayMessage::new("conflicted job run found", format!("force started replay with ID: {id}"))
        );
        assert_eq!(store.get_by_id(finished.id).await.unwrap().status, ReplayStatus::Success);
    }
}
