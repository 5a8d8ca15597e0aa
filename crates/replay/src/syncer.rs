//! Follows active replays until they settle.
//!
//! A `Replayed` replay is finished once the scheduler reports no run of its
//! tree as running: any failed run fails the replay, otherwise it succeeds.
//! A replay still `Accepted` or `In Progress` after the run timeout is
//! failed.

use chrono::Duration;
use optimus_core::{
    JobRunState, ProjectSpec, ReplayMessage, ReplaySpec, ReplayStatus, Scheduler,
    MESSAGE_ALL_RUNS_SUCCEEDED, MESSAGE_INSTANCE_RUN_FAILED, MESSAGE_RUNTIME_TIMEOUT,
};
use optimus_storage::{ProjectRepository, ReplaySpecRepository};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::validator::RUN_STATUS_BATCH_SIZE;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RunCounts {
    success: usize,
    failed: usize,
    running: usize,
}

/// Moves active replays to their final status.
#[derive(Clone)]
pub struct ReplaySyncer {
    repo: Arc<dyn ReplaySpecRepository>,
    project_repo: Arc<dyn ProjectRepository>,
    scheduler: Arc<dyn Scheduler>,
    run_timeout: std::time::Duration,
}

impl ReplaySyncer {
    /// Create a syncer.
    pub fn new(
        repo: Arc<dyn ReplaySpecRepository>,
        project_repo: Arc<dyn ProjectRepository>,
        scheduler: Arc<dyn Scheduler>,
        run_timeout: std::time::Duration,
    ) -> Self {
        Self {
            repo,
            project_repo,
            scheduler,
            run_timeout,
        }
    }

    /// One pass over the active replays of every project.
    ///
    /// A replay that cannot be synced is logged and retried on the next pass.
    pub async fn sync(&self) -> Result<()> {
        for project in self.project_repo.get_all().await? {
            let replays = match self
                .repo
                .get_by_project_id_and_status(project.id, &ReplayStatus::ACTIVE)
                .await
            {
                Ok(replays) => replays,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };

            for replay in replays {
                let synced = if replay.status == ReplayStatus::Replayed {
                    self.sync_replayed(&project, &replay).await
                } else {
                    self.fail_if_timed_out(&replay).await
                };
                if let Err(e) = synced {
                    warn!("failed to sync replay {}: {}", replay.id, e);
                }
            }
        }
        Ok(())
    }

    async fn sync_replayed(&self, project: &ProjectSpec, replay: &ReplaySpec) -> Result<()> {
        let end = replay.end_date + Duration::days(1) - Duration::seconds(1);
        let mut counts = RunCounts::default();
        for node in replay.execution_tree.nodes() {
            let statuses = self
                .scheduler
                .get_job_run_status(project, &node.name, replay.start_date, end, RUN_STATUS_BATCH_SIZE)
                .await?;
            for status in statuses {
                match status.state {
                    JobRunState::Success => counts.success += 1,
                    JobRunState::Failed => counts.failed += 1,
                    JobRunState::Running | JobRunState::Queued => counts.running += 1,
                }
            }
        }
        debug!("replay {} run counts: {:?}", replay.id, counts);

        if counts.running > 0 {
            return Ok(());
        }
        if counts.failed > 0 {
            warn!("replay {} has {} failed runs", replay.id, counts.failed);
            self.repo
                .update_status(
                    replay.id,
                    ReplayStatus::Failed,
                    ReplayMessage::new(ReplayStatus::Failed.to_string(), MESSAGE_INSTANCE_RUN_FAILED),
                )
                .await?;
        } else if counts.success > 0 {
            info!("replay {} finished successfully", replay.id);
            self.repo
                .update_status(
                    replay.id,
                    ReplayStatus::Success,
                    ReplayMessage::new(ReplayStatus::Success.to_string(), MESSAGE_ALL_RUNS_SUCCEEDED),
                )
                .await?;
        }
        Ok(())
    }

    async fn fail_if_timed_out(&self, replay: &ReplaySpec) -> Result<()> {
        let timeout = Duration::from_std(self.run_timeout).unwrap_or(Duration::MAX);
        if chrono::Utc::now() - replay.created_at <= timeout {
            return Ok(());
        }

        warn!("replay {} exceeded {:?}, failing", replay.id, self.run_timeout);
        let message = format!(
            "replay has been running since {}",
            replay.created_at.format("%Y-%m-%dT%H:%M:%S+00:00")
        );
        self.repo
            .update_status(
                replay.id,
                ReplayStatus::Failed,
                ReplayMessage::new(MESSAGE_RUNTIME_TIMEOUT, message),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{at, create_test_job, create_test_request};
    use crate::plan::ReplayTreeBuilder;
    use crate::validator::tests::{create_test_spec, FakeScheduler};
    use optimus_core::JobStatus;
    use optimus_storage::MemoryStore;

    async fn setup(status: ReplayStatus) -> (Arc<MemoryStore>, Arc<FakeScheduler>, ReplaySpec) {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectSpec::new("p");
        ProjectRepository::save(store.as_ref(), &project).await.unwrap();

        let request = create_test_request(
            "job-name",
            at(2020, 8, 5, 0),
            at(2020, 8, 6, 0),
            &project,
            vec![create_test_job("job-name", "ns")],
        );
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();
        let spec = create_test_spec(&request, plan.execution_tree, status);
        store.insert(&spec).await.unwrap();
        (store, Arc::new(FakeScheduler::default()), spec)
    }

    fn create_test_syncer(store: Arc<MemoryStore>, scheduler: Arc<FakeScheduler>) -> ReplaySyncer {
        ReplaySyncer::new(store.clone(), store, scheduler, std::time::Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_all_runs_succeeded() {
        let (store, scheduler, spec) = setup(ReplayStatus::Replayed).await;
        scheduler
            .set_statuses(
                "job-name",
                vec![
                    JobStatus::new(at(2020, 8, 5, 2), JobRunState::Success),
                    JobStatus::new(at(2020, 8, 6, 2), JobRunState::Success),
                ],
            )
            .await;

        create_test_syncer(store.clone(), scheduler).sync().await.unwrap();

        let stored = store.get_by_id(spec.id).await.unwrap();
        assert_eq!(stored.status, ReplayStatus::Success);
        assert_eq!(stored.message, ReplayMessage::new("Success", MESSAGE_ALL_RUNS_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_failed_run_fails_replay() {
        let (store, scheduler, spec) = setup(ReplayStatus::Replayed).await;
        scheduler
            .set_statuses(
                "job-name",
                vec![
                    JobStatus::new(at(2020, 8, 5, 2), JobRunState::Success),
                    JobStatus::new(at(2020, 8, 6, 2), JobRunState::Failed),
                ],
            )
            .await;

        create_test_syncer(store.clone(), scheduler).sync().await.unwrap();

        let stored = store.get_by_id(spec.id).await.unwrap();
        assert_eq!(stored.status, ReplayStatus::Failed);
        assert_eq!(stored.message, ReplayMessage::new("Failed", MESSAGE_INSTANCE_RUN_FAILED));
    }

    #[tokio::test]
    async fn test_running_runs_keep_replay_open() {
        let (store, scheduler, spec) = setup(ReplayStatus::Replayed).await;
        scheduler
            .set_statuses(
                "job-name",
                vec![
                    JobStatus::new(at(2020, 8, 5, 2), JobRunState::Failed),
                    JobStatus::new(at(2020, 8, 6, 2), JobRunState::Running),
                ],
            )
            .await;

        create_test_syncer(store.clone(), scheduler).sync().await.unwrap();

        assert_eq!(store.get_by_id(spec.id).await.unwrap().status, ReplayStatus::Replayed);
    }

    #[tokio::test]
    async fn test_failing_replay_does_not_stop_the_pass() {
        let (store, _, healthy) = setup(ReplayStatus::Replayed).await;
        let project = ProjectRepository::get_by_name(store.as_ref(), "p").await.unwrap();
        let request = create_test_request(
            "broken",
            at(2020, 8, 5, 0),
            at(2020, 8, 6, 0),
            &project,
            vec![create_test_job("broken", "ns")],
        );
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();
        let broken = create_test_spec(&request, plan.execution_tree, ReplayStatus::Replayed);
        store.insert(&broken).await.unwrap();

        let scheduler = Arc::new(FakeScheduler {
            failing_job: Some("broken".to_string()),
            ..Default::default()
        });
        scheduler
            .set_statuses("job-name", vec![JobStatus::new(at(2020, 8, 5, 2), JobRunState::Success)])
            .await;

        create_test_syncer(store.clone(), scheduler).sync().await.unwrap();

        assert_eq!(store.get_by_id(healthy.id).await.unwrap().status, ReplayStatus::Success);
        assert_eq!(store.get_by_id(broken.id).await.unwrap().status, ReplayStatus::Replayed);
    }

    #[tokio::test]
    async fn test_stale_accepted_replay_times_out() {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectSpec::new("p");
        ProjectRepository::save(store.as_ref(), &project).await.unwrap();
        let request = create_test_request(
            "job-name",
            at(2020, 8, 5, 0),
            at(2020, 8, 6, 0),
            &project,
            vec![create_test_job("job-name", "ns")],
        );
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();

        let mut stale = create_test_spec(&request, plan.execution_tree.clone(), ReplayStatus::Accepted);
        stale.created_at = at(2021, 1, 1, 10);
        store.insert(&stale).await.unwrap();
        let fresh = create_test_spec(&request, plan.execution_tree, ReplayStatus::InProgress);
        store.insert(&fresh).await.unwrap();

        create_test_syncer(store.clone(), Arc::new(FakeScheduler::default()))
            .sync()
            .await
            .unwrap();

        let stored = store.get_by_id(stale.id).await.unwrap();
        assert_eq!(stored.status, ReplayStatus::Failed);
        assert_eq!(
            stored.message,
            ReplayMessage::new(
                MESSAGE_RUNTIME_TIMEOUT,
                "replay has been running since 2021-01-01T10:00:00+00:00"
            )
        );
        assert_eq!(store.get_by_id(fresh.id).await.unwrap().status, ReplayStatus::InProgress);
    }
}
