//! Replay request intake and worker pool.
//!
//! A request is planned and validated synchronously, persisted as
//! `Accepted`, then queued on a bounded channel served by a fixed pool of
//! workers. Intake is serialised by the request map lock so two overlapping
//! requests cannot both pass validation. A background syncer moves replayed
//! requests to their final status.

use chrono::Duration;
use optimus_core::{
    JobStatus, ProjectId, ProjectSpec, ReplayConfig, ReplayId, ReplayMessage, ReplayPlan,
    ReplayRequest, ReplaySpec, ReplayStatus, Scheduler, Time, MESSAGE_REQUEST_QUEUE_FULL,
};
use optimus_progress::{Event, EventBus, ReplayEvent};
use optimus_storage::{ProjectRepository, ReplaySpecRepository};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ReplayError, Result};
use crate::plan::ReplayTreeBuilder;
use crate::syncer::ReplaySyncer;
use crate::validator::{ReplayValidator, RUN_STATUS_BATCH_SIZE};
use crate::worker::{ReplayWorker, ReplayWorkerRequest};

/// Replays older than this are left out of listings.
const REPLAY_LIST_WINDOW_DAYS: i64 = 90;

/// A replay with the scheduler's view of its runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayState {
    /// Replay status
    pub status: ReplayStatus,
    /// One entry per job of the execution tree
    pub nodes: Vec<ReplayNodeState>,
}

/// Run states of one replayed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayNodeState {
    /// Job name
    pub name: String,
    /// Names of the replayed downstream jobs
    pub dependents: Vec<String>,
    /// Runs ordered by schedule time
    pub runs: Vec<JobStatus>,
}

/// Serves replay requests with a fixed pool of workers.
pub struct ReplayManager {
    config: ReplayConfig,
    repo: Arc<dyn ReplaySpecRepository>,
    project_repo: Arc<dyn ProjectRepository>,
    scheduler: Arc<dyn Scheduler>,
    builder: ReplayTreeBuilder,
    validator: ReplayValidator,
    worker: ReplayWorker,
    syncer: ReplaySyncer,
    bus: Option<EventBus<Event>>,
    requests: Mutex<HashSet<ReplayId>>,
    sender: mpsc::Sender<ReplayWorkerRequest>,
    receiver: Arc<Mutex<mpsc::Receiver<ReplayWorkerRequest>>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplayManager {
    /// Create a manager. Requests queue up until [`start`](Self::start).
    pub fn new(
        config: ReplayConfig,
        scheduler: Arc<dyn Scheduler>,
        repo: Arc<dyn ReplaySpecRepository>,
        project_repo: Arc<dyn ProjectRepository>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            validator: ReplayValidator::new(scheduler.clone()),
            worker: ReplayWorker::new(repo.clone(), scheduler.clone()),
            syncer: ReplaySyncer::new(repo.clone(), project_repo.clone(), scheduler.clone(), config.run_timeout),
            builder: ReplayTreeBuilder::new(),
            config,
            repo,
            project_repo,
            scheduler,
            bus: None,
            requests: Mutex::new(HashSet::new()),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Publish replay preparation outcomes on this bus.
    pub fn with_event_bus(mut self, bus: EventBus<Event>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spawn the workers and the syncer.
    pub async fn start(self: &Arc<Self>) {
        let workers = self.config.num_workers.max(1);
        let mut handles = self.handles.lock().await;
        info!("starting {} replay workers", workers);
        for worker in 0..workers {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                manager.run_worker(worker).await;
            }));
        }

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            manager.run_syncer().await;
        }));
    }

    /// Plan, validate, persist and queue a replay.
    pub async fn replay(&self, request: ReplayRequest) -> Result<ReplayId> {
        let mut requests = self.requests.lock().await;
        if self.cancel.is_cancelled() {
            return Err(ReplayError::Closed);
        }

        let plan = self.builder.plan(&request)?;
        let id = ReplayId::new();
        self.validator
            .validate(self.repo.as_ref(), &request, &plan.execution_tree, id)
            .await?;

        let now = chrono::Utc::now();
        let spec = ReplaySpec {
            id,
            job: request.job.clone(),
            project: request.project.to_ref(),
            start_date: request.start,
            end_date: request.end,
            status: ReplayStatus::Accepted,
            ignore_downstream: request.ignore_downstream,
            execution_tree: plan.execution_tree.clone(),
            message: ReplayMessage::default(),
            created_at: now,
            updated_at: now,
        };
        self.repo.insert(&spec).await?;

        let queued = ReplayWorkerRequest {
            id,
            project: request.project,
            execution_tree: plan.execution_tree,
        };
        match self.sender.try_send(queued) {
            Ok(()) => {
                requests.insert(id);
                info!("replay {} of job {} accepted", id, spec.job.name);
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                warn!("replay queue is full, cancelling replay {}", id);
                self.repo
                    .update_status(
                        id,
                        ReplayStatus::Cancelled,
                        ReplayMessage::new(ReplayStatus::Cancelled.to_string(), MESSAGE_REQUEST_QUEUE_FULL),
                    )
                    .await?;
                Err(ReplayError::RequestQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(ReplayError::Closed),
        }
    }

    /// Replays queued or being prepared by a worker.
    pub async fn in_flight(&self) -> Vec<ReplayId> {
        self.requests.lock().await.iter().copied().collect()
    }

    /// Plan a replay without persisting it.
    pub fn plan(&self, request: &ReplayRequest) -> Result<ReplayPlan> {
        self.builder.plan(request)
    }

    /// Load a replay.
    pub async fn get_replay(&self, id: ReplayId) -> Result<ReplaySpec> {
        Ok(self.repo.get_by_id(id).await?)
    }

    /// Replays of a project created in the last 90 days, newest first.
    pub async fn get_replay_list(&self, project_id: ProjectId) -> Result<Vec<ReplaySpec>> {
        let replays = match self.repo.get_by_project_id(project_id).await {
            Ok(replays) => replays,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let since = chrono::Utc::now() - Duration::days(REPLAY_LIST_WINDOW_DAYS);
        Ok(replays.into_iter().filter(|r| r.created_at > since).collect())
    }

    /// Scheduler run states of a job from `start` through the end of `end`'s day.
    pub async fn get_run_status(
        &self,
        project: &ProjectSpec,
        job_name: &str,
        start: Time,
        end: Time,
    ) -> Result<Vec<JobStatus>> {
        let end = end + Duration::days(1) - Duration::seconds(1);
        Ok(self
            .scheduler
            .get_job_run_status(project, job_name, start, end, RUN_STATUS_BATCH_SIZE)
            .await?)
    }

    /// A replay with the current run states of every job in its tree.
    pub async fn get_replay_status_tree(&self, id: ReplayId) -> Result<ReplayState> {
        let replay = self.repo.get_by_id(id).await?;
        let project = self.project_repo.get_by_name(&replay.project.name).await?;

        let tree = &replay.execution_tree;
        let mut nodes = Vec::with_capacity(tree.len());
        for node in tree.nodes() {
            let mut runs = self
                .get_run_status(&project, &node.name, replay.start_date, replay.end_date)
                .await?;
            runs.sort_by_key(|run| run.scheduled_at);
            runs.dedup_by_key(|run| run.scheduled_at);
            nodes.push(ReplayNodeState {
                name: node.name.clone(),
                dependents: node.dependents.iter().map(|&child| tree.node(child).name.clone()).collect(),
                runs,
            });
        }
        Ok(ReplayState {
            status: replay.status,
            nodes,
        })
    }

    /// Stop accepting work, stop the syncer and wait for the workers to
    /// drain the queue.
    pub async fn close(&self) {
        {
            let _intake = self.requests.lock().await;
            self.cancel.cancel();
        }
        let queued = self.sender.max_capacity() - self.sender.capacity();
        if queued > 0 {
            info!("draining {} queued replays", queued);
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("replay task ended abnormally: {}", e);
            }
        }
        info!("replay manager closed");
    }

    async fn run_syncer(&self) {
        let mut interval = tokio::time::interval(self.config.sync_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.syncer.sync().await {
                        error!("failed to sync replays: {}", e);
                    }
                }
            }
        }
        debug!("replay syncer stopped");
    }

    async fn run_worker(&self, worker: usize) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    request = receiver.recv() => request,
                    _ = self.cancel.cancelled() => None,
                }
            };
            let Some(request) = next else {
                break;
            };
            info!("replay worker {} picked up replay {}", worker, request.id);
            self.process(request).await;
        }
        debug!("replay worker {} stopped", worker);
    }

    async fn process(&self, request: ReplayWorkerRequest) {
        let outcome = match tokio::time::timeout(self.config.worker_timeout, self.worker.process(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = ReplayError::Timeout(self.config.worker_timeout);
                let message = ReplayMessage::new(ReplayStatus::Failed.to_string(), err.to_string());
                if let Err(e) = self.repo.update_status(request.id, ReplayStatus::Failed, message).await {
                    error!("failed to record timeout of replay {}: {}", request.id, e);
                }
                Err(err)
            }
        };

        self.requests.lock().await.remove(&request.id);
        match outcome {
            Ok(ReplayStatus::Replayed) => self.publish(ReplayEvent::Prepared(request.id)),
            Ok(status) => debug!("replay {} ended {}", request.id, status),
            Err(e) => {
                error!("replay {} failed to prepare: {}", request.id, e);
                self.publish(ReplayEvent::FailedToPrepare(request.id));
            }
        }
    }

    fn publish(&self, event: ReplayEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{at, create_test_job, create_test_request, depend_on};
    use crate::validator::tests::{create_test_spec, FakeScheduler};
    use optimus_core::JobRunState;
    use optimus_storage::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, Arc<FakeScheduler>, ReplayRequest) {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectSpec::new("project-name");
        ProjectRepository::save(store.as_ref(), &project).await.unwrap();

        let root = create_test_job("job-name", "ns");
        let child = depend_on(create_test_job("child", "ns"), &root, &project);
        let request = create_test_request(
            "job-name",
            at(2020, 8, 22, 0),
            at(2020, 8, 26, 0),
            &project,
            vec![root, child],
        );
        (store, Arc::new(FakeScheduler::default()), request)
    }

    fn create_test_manager(store: Arc<MemoryStore>, scheduler: Arc<FakeScheduler>, config: ReplayConfig) -> ReplayManager {
        ReplayManager::new(config, scheduler, store.clone(), store)
    }

    #[tokio::test]
    async fn test_replay_is_cleared_by_a_worker() {
        let (store, scheduler, request) = setup().await;
        let bus: EventBus<Event> = EventBus::new();
        let mut events = bus.subscribe();
        let manager = Arc::new(
            create_test_manager(store, scheduler.clone(), ReplayConfig::default()).with_event_bus(bus),
        );
        manager.start().await;

        let id = manager.replay(request).await.unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event, Event::Replay(ReplayEvent::Prepared(id)));
        assert_eq!(manager.get_replay(id).await.unwrap().status, ReplayStatus::Replayed);
        assert_eq!(scheduler.cleared.lock().await.len(), 2);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_conflicting_replay_is_rejected_unless_forced() {
        let (store, scheduler, request) = setup().await;
        let manager = create_test_manager(store, scheduler, ReplayConfig::default());

        let first = manager.replay(request.clone()).await.unwrap();
        let err = manager.replay(request.clone()).await.unwrap_err();
        assert!(matches!(err, ReplayError::ConflictedJobRun));

        let second = manager.replay(request.with_force(true)).await.unwrap();
        let cancelled = manager.get_replay(first).await.unwrap();
        assert_eq!(cancelled.status, ReplayStatus::Cancelled);
        assert!(cancelled.message.message.contains(&second.to_string()));
        assert_eq!(manager.get_replay(second).await.unwrap().status, ReplayStatus::Accepted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overlapping_replays_accept_one() {
        let (store, scheduler, request) = setup().await;
        let manager = Arc::new(create_test_manager(store.clone(), scheduler, ReplayConfig::default()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let request = request.clone();
                tokio::spawn(async move { manager.replay(request).await })
            })
            .collect();
        let mut accepted = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(id) => accepted.push(id),
                Err(e) => assert!(matches!(e, ReplayError::ConflictedJobRun)),
            }
        }

        assert_eq!(accepted.len(), 1);
        assert_eq!(manager.in_flight().await, accepted);
        let project = request_project(&store).await;
        let active = store
            .get_by_project_id_and_status(project.id, &ReplayStatus::ACTIVE)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_queued_replays() {
        let (store, scheduler, request) = setup().await;
        let manager = Arc::new(create_test_manager(store, scheduler.clone(), ReplayConfig::default()));

        let id = manager.replay(request).await.unwrap();
        assert_eq!(manager.in_flight().await, vec![id]);
        manager.start().await;
        manager.close().await;

        assert_eq!(manager.get_replay(id).await.unwrap().status, ReplayStatus::Replayed);
        assert_eq!(scheduler.cleared.lock().await.len(), 2);
        assert!(manager.in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_cancels_the_replay() {
        let (store, scheduler, request) = setup().await;
        let manager = create_test_manager(
            store.clone(),
            scheduler,
            ReplayConfig::default().with_queue_capacity(1),
        );

        manager.replay(request.clone()).await.unwrap();
        let err = manager.replay(request.with_force(true)).await.unwrap_err();
        assert!(matches!(err, ReplayError::RequestQueueFull));

        let project = request_project(&store).await;
        let replays = manager.get_replay_list(project.id).await.unwrap();
        let rejected = replays
            .iter()
            .find(|r| r.message.message == MESSAGE_REQUEST_QUEUE_FULL)
            .unwrap();
        assert_eq!(rejected.status, ReplayStatus::Cancelled);
        assert_eq!(rejected.message.message_type, "Cancelled");
    }

    async fn request_project(store: &MemoryStore) -> ProjectSpec {
        ProjectRepository::get_by_name(store, "project-name").await.unwrap()
    }

    #[tokio::test]
    async fn test_replay_list_skips_old_replays() {
        let (store, scheduler, request) = setup().await;
        let manager = create_test_manager(store.clone(), scheduler, ReplayConfig::default());
        let plan = manager.plan(&request).unwrap();

        let recent = create_test_spec(&request, plan.execution_tree.clone(), ReplayStatus::Success);
        store.insert(&recent).await.unwrap();
        let mut old = create_test_spec(&request, plan.execution_tree, ReplayStatus::Success);
        old.created_at = chrono::Utc::now() - Duration::days(120);
        store.insert(&old).await.unwrap();

        let replays = manager.get_replay_list(request.project.id).await.unwrap();
        assert_eq!(replays.len(), 1);
        assert_eq!(replays[0].id, recent.id);
        assert!(manager.get_replay_list(ProjectId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_tree_reports_runs() {
        let (store, scheduler, request) = setup().await;
        let manager = create_test_manager(store, scheduler.clone(), ReplayConfig::default());
        let id = manager.replay(request).await.unwrap();
        // runs restart once the replay has been accepted
        scheduler
            .set_statuses(
                "child",
                vec![
                    JobStatus::new(at(2020, 8, 23, 2), JobRunState::Running),
                    JobStatus::new(at(2020, 8, 22, 2), JobRunState::Success),
                ],
            )
            .await;

        let state = manager.get_replay_status_tree(id).await.unwrap();

        assert_eq!(state.status, ReplayStatus::Accepted);
        let root = state.nodes.iter().find(|n| n.name == "job-name").unwrap();
        assert_eq!(root.dependents, vec!["child".to_string()]);
        assert!(root.runs.is_empty());
        let child = state.nodes.iter().find(|n| n.name == "child").unwrap();
        assert_eq!(
            child.runs,
            vec![
                JobStatus::new(at(2020, 8, 22, 2), JobRunState::Success),
                JobStatus::new(at(2020, 8, 23, 2), JobRunState::Running),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_status_is_end_inclusive() {
        let (store, scheduler, request) = setup().await;
        scheduler
            .set_statuses(
                "job-name",
                vec![
                    JobStatus::new(at(2020, 8, 26, 2), JobRunState::Success),
                    JobStatus::new(at(2020, 8, 27, 2), JobRunState::Success),
                ],
            )
            .await;
        let manager = create_test_manager(store, scheduler, ReplayConfig::default());

        let runs = manager
            .get_run_status(&request.project, "job-name", at(2020, 8, 22, 0), at(2020, 8, 26, 0))
            .await
            .unwrap();
        assert_eq!(runs, vec![JobStatus::new(at(2020, 8, 26, 2), JobRunState::Success)]);
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_replays() {
        let (store, scheduler, request) = setup().await;
        let manager = create_test_manager(store, scheduler, ReplayConfig::default());
        manager.close().await;

        assert!(matches!(manager.replay(request).await, Err(ReplayError::Closed)));
    }
}
