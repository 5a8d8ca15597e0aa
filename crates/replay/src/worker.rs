//! Clears the runs of an accepted replay in the scheduler.

use optimus_core::{
    MultiRootTree, ProjectSpec, ReplayId, ReplayMessage, ReplayStatus, Scheduler,
    MESSAGE_CLEAR_RUN_FAILED,
};
use optimus_storage::ReplaySpecRepository;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ReplayError, Result};

/// A replay handed to a worker.
#[derive(Debug, Clone)]
pub struct ReplayWorkerRequest {
    /// Replay being processed
    pub id: ReplayId,
    /// Project of the replayed jobs
    pub project: ProjectSpec,
    /// Jobs and runs to clear
    pub execution_tree: MultiRootTree,
}

/// Moves a replay from `Accepted` to `Replayed`.
#[derive(Clone)]
pub struct ReplayWorker {
    repo: Arc<dyn ReplaySpecRepository>,
    scheduler: Arc<dyn Scheduler>,
}

impl ReplayWorker {
    /// Create a worker.
    pub fn new(repo: Arc<dyn ReplaySpecRepository>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { repo, scheduler }
    }

    /// Clear every job's runs, one scheduler call per job.
    ///
    /// Returns the status the replay ends in. A clear failure marks the
    /// replay `Failed` before the error is returned. A replay cancelled while
    /// its runs were cleared stays `Cancelled`.
    pub async fn process(&self, request: &ReplayWorkerRequest) -> Result<ReplayStatus> {
        self.repo
            .update_status(request.id, ReplayStatus::InProgress, ReplayMessage::default())
            .await?;

        for node in request.execution_tree.nodes() {
            let (Some(first), Some(last)) = (node.runs.first(), node.runs.last()) else {
                debug!("job {} has no runs to clear", node.name);
                continue;
            };
            if let Err(source) = self.scheduler.clear(&request.project, &node.name, *first, *last).await {
                let err = ReplayError::ClearFailed {
                    job: node.name.clone(),
                    source,
                };
                warn!("replay {}: {}", request.id, err);
                self.repo
                    .update_status(
                        request.id,
                        ReplayStatus::Failed,
                        ReplayMessage::new(MESSAGE_CLEAR_RUN_FAILED, err.to_string()),
                    )
                    .await?;
                return Err(err);
            }
        }

        let current = self.repo.get_by_id(request.id).await?;
        if current.status == ReplayStatus::Cancelled {
            info!("replay {} was cancelled while its runs were cleared", request.id);
            return Ok(ReplayStatus::Cancelled);
        }

        self.repo
            .update_status(request.id, ReplayStatus::Replayed, ReplayMessage::default())
            .await?;
        info!("replay {} cleared {} jobs", request.id, request.execution_tree.len());
        Ok(ReplayStatus::Replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{at, create_test_job, create_test_request, depend_on};
    use crate::plan::ReplayTreeBuilder;
    use crate::validator::tests::{create_test_spec, FakeScheduler};
    use optimus_storage::MemoryStore;

    async fn setup(scheduler: FakeScheduler) -> (Arc<MemoryStore>, Arc<FakeScheduler>, ReplayWorkerRequest) {
        let project = ProjectSpec::new("p");
        let root = create_test_job("job-name", "ns");
        let child = depend_on(create_test_job("child", "ns"), &root, &project);
        let request = create_test_request("job-name", at(2020, 8, 5, 0), at(2020, 8, 7, 0), &project, vec![root, child]);
        let plan = ReplayTreeBuilder::new().plan(&request).unwrap();

        let store = Arc::new(MemoryStore::new());
        let spec = create_test_spec(&request, plan.execution_tree.clone(), ReplayStatus::Accepted);
        store.insert(&spec).await.unwrap();

        let worker_request = ReplayWorkerRequest {
            id: spec.id,
            project,
            execution_tree: plan.execution_tree,
        };
        (store, Arc::new(scheduler), worker_request)
    }

    #[tokio::test]
    async fn test_runs_are_cleared_per_job() {
        let (store, scheduler, request) = setup(FakeScheduler::default()).await;
        let worker = ReplayWorker::new(store.clone(), scheduler.clone());

        let status = worker.process(&request).await.unwrap();

        assert_eq!(status, ReplayStatus::Replayed);
        assert_eq!(store.get_by_id(request.id).await.unwrap().status, ReplayStatus::Replayed);
        let mut cleared = scheduler.cleared.lock().await.clone();
        cleared.sort();
        assert_eq!(
            cleared,
            vec![
                ("child".to_string(), at(2020, 8, 5, 2), at(2020, 8, 7, 2)),
                ("job-name".to_string(), at(2020, 8, 5, 2), at(2020, 8, 7, 2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_clear_failure_marks_replay_failed() {
        let scheduler = FakeScheduler {
            failing_job: Some("job-name".to_string()),
            ..Default::default()
        };
        let (store, scheduler, request) = setup(scheduler).await;
        let worker = ReplayWorker::new(store.clone(), scheduler);

        let err = worker.process(&request).await.unwrap_err();
        assert!(err.to_string().contains("clear rejected"));

        let stored = store.get_by_id(request.id).await.unwrap();
        assert_eq!(stored.status, ReplayStatus::Failed);
        assert_eq!(stored.message.message_type, MESSAGE_CLEAR_RUN_FAILED);
        assert!(stored
            .message
            .message
            .starts_with("error while clearing dag runs for job job-name: "));
    }

    #[tokio::test]
    async fn test_missing_replay_is_an_error() {
        let (_, scheduler, request) = setup(FakeScheduler::default()).await;
        let worker = ReplayWorker::new(Arc::new(MemoryStore::new()), scheduler);

        let err = worker.process(&request).await.unwrap_err();
        assert!(matches!(err, ReplayError::Storage(e) if e.is_not_found()));
    }
}
