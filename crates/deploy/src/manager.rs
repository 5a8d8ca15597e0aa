//! Deployment request queue and worker pool.
//!
//! Requests are stored as `In Queue` rows. An assignment loop moves the
//! oldest row to `In Progress` with a compare-and-set on status and update
//! time, then hands it to an idle worker over a bounded channel. Rows stuck
//! `In Progress` past the worker deadline are cancelled by the same loop.

use optimus_core::{
    DeployConfig, DeploymentId, DeploymentStatus, JobDeployment, Observer, ProjectSpec,
};
use optimus_progress::{DeploymentEvent, Event, EventBus};
use optimus_storage::{JobDeploymentRepository, ProjectRepository};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deployer::Deployer;
use crate::error::{DeployError, Result};

/// Serves deployment requests with a fixed pool of workers.
pub struct DeployManager {
    config: DeployConfig,
    deployer: Arc<Deployer>,
    deploy_repo: Arc<dyn JobDeploymentRepository>,
    project_repo: Arc<dyn ProjectRepository>,
    bus: Option<EventBus<Event>>,
    observer: Option<Arc<dyn Observer>>,
    sender: Mutex<Option<mpsc::Sender<JobDeployment>>>,
    idle_workers: Arc<AtomicUsize>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeployManager {
    /// Create a manager. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: DeployConfig,
        deployer: Arc<Deployer>,
        deploy_repo: Arc<dyn JobDeploymentRepository>,
        project_repo: Arc<dyn ProjectRepository>,
    ) -> Self {
        Self {
            config,
            deployer,
            deploy_repo,
            project_repo,
            bus: None,
            observer: None,
            sender: Mutex::new(None),
            idle_workers: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Publish finished deployments on this bus.
    pub fn with_event_bus(mut self, bus: EventBus<Event>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Forward deployment progress to this observer.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Spawn the workers and the assignment loop.
    pub async fn start(self: &Arc<Self>) {
        let workers = self.config.num_workers.max(1);
        let (sender, receiver) = mpsc::channel::<JobDeployment>(workers);
        let receiver = Arc::new(Mutex::new(receiver));
        *self.sender.lock().await = Some(sender);

        let mut handles = self.handles.lock().await;
        info!("starting {} deployers", workers);
        for worker in 0..workers {
            let manager = Arc::clone(self);
            let receiver = Arc::clone(&receiver);
            self.idle_workers.fetch_add(1, Ordering::SeqCst);
            handles.push(tokio::spawn(async move {
                manager.run_worker(worker, receiver).await;
            }));
        }

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            manager.run_assigner().await;
        }));
    }

    /// Queue a deployment of `project`.
    ///
    /// Returns the id of the project's already queued deployment if there is
    /// one.
    pub async fn deploy(&self, project: &ProjectSpec) -> Result<DeploymentId> {
        if self.cancel.is_cancelled() {
            return Err(DeployError::Closed);
        }

        match self
            .deploy_repo
            .get_by_status_and_project_id(DeploymentStatus::InQueue, project.id)
            .await
        {
            Ok(existing) => {
                debug!("deployment {} already queued for project {}", existing.id, project.name);
                return Ok(existing.id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let queued = self.deploy_repo.get_by_status(DeploymentStatus::InQueue).await?;
        if queued.len() >= self.config.queue_capacity {
            warn!("deployment queue is full, rejecting project {}", project.name);
            return Err(DeployError::RequestQueueFull);
        }

        let deployment = self
            .deploy_repo
            .save_if_not_queued(&JobDeployment::queued(project.to_ref()))
            .await?;
        info!("deployment {} queued for project {}", deployment.id, project.name);
        Ok(deployment.id)
    }

    /// Load a deployment.
    pub async fn get_status(&self, id: DeploymentId) -> Result<JobDeployment> {
        Ok(self.deploy_repo.get_by_id(id).await?)
    }

    /// Workers currently waiting for work.
    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::SeqCst)
    }

    /// Cancel timed-out deployments and hand queued ones to idle workers.
    ///
    /// Returns how many deployments were dispatched.
    pub async fn assign(&self) -> Result<usize> {
        self.cancel_timed_out().await?;

        let Some(sender) = self.sender.lock().await.clone() else {
            return Ok(0);
        };

        let mut dispatched = 0;
        while dispatched < self.idle_workers() {
            let Ok(permit) = sender.try_reserve() else {
                break;
            };
            let request = match self.deploy_repo.get_first_executable_request().await {
                Ok(request) => request,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e.into()),
            };

            let claimed = self
                .deploy_repo
                .update_status_if(
                    request.id,
                    DeploymentStatus::InQueue,
                    request.updated_at,
                    DeploymentStatus::InProgress,
                )
                .await?;
            if !claimed {
                debug!("deployment {} was claimed elsewhere", request.id);
                break;
            }

            let request = self.deploy_repo.get_by_id(request.id).await?;
            debug!("assigning deployment {}", request.id);
            permit.send(request);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Stop assigning, let workers drain, and wait for them.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.sender.lock().await.take();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("deploy task ended abnormally: {}", e);
            }
        }
        info!("deploy manager closed");
    }

    async fn cancel_timed_out(&self) -> Result<()> {
        let timeout = chrono::Duration::from_std(self.config.worker_timeout).unwrap_or(chrono::Duration::MAX);
        let now = chrono::Utc::now();
        for deployment in self.deploy_repo.get_by_status(DeploymentStatus::InProgress).await? {
            if now - deployment.updated_at <= timeout {
                continue;
            }
            let cancelled = self
                .deploy_repo
                .update_status_if(
                    deployment.id,
                    DeploymentStatus::InProgress,
                    deployment.updated_at,
                    DeploymentStatus::Cancelled,
                )
                .await?;
            if cancelled {
                warn!("deployment {} exceeded {:?}, cancelled", deployment.id, self.config.worker_timeout);
                self.publish(&deployment, DeploymentStatus::Cancelled);
            }
        }
        Ok(())
    }

    async fn run_assigner(&self) {
        let mut interval = tokio::time::interval(self.config.assign_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.assign().await {
                        error!("failed to assign deployments: {}", e);
                    }
                }
            }
        }
        debug!("deployment assigner stopped");
    }

    async fn run_worker(&self, worker: usize, receiver: Arc<Mutex<mpsc::Receiver<JobDeployment>>>) {
        loop {
            let next = receiver.lock().await.recv().await;
            let Some(deployment) = next else {
                break;
            };
            self.idle_workers.fetch_sub(1, Ordering::SeqCst);
            info!("deployer {} picked up deployment {}", worker, deployment.id);

            if let Err(e) = self.process(deployment).await {
                error!("deployment worker failed to process: {}", e);
            }
            self.idle_workers.fetch_add(1, Ordering::SeqCst);
        }
        self.idle_workers.fetch_sub(1, Ordering::SeqCst);
        debug!("deployer {} stopped", worker);
    }

    async fn process(&self, mut deployment: JobDeployment) -> Result<()> {
        let claimed_at = deployment.updated_at;
        let outcome = match self.project_repo.get_by_name(&deployment.project.name).await {
            Ok(project) => {
                let run = self.deployer.deploy(&project, self.observer.as_deref());
                match tokio::time::timeout(self.config.worker_timeout, run).await {
                    Ok(result) => result,
                    Err(_) => Err(DeployError::Timeout(self.config.worker_timeout)),
                }
            }
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(detail) => {
                deployment.status = if detail.failure_count > 0 {
                    DeploymentStatus::Failed
                } else {
                    DeploymentStatus::Succeed
                };
                deployment.details = detail;
            }
            Err(DeployError::Namespaces { errors, detail }) => {
                warn!("deployment {} finished with {} namespace errors", deployment.id, errors.len());
                deployment.status = DeploymentStatus::Failed;
                deployment.details = detail;
            }
            Err(e) => {
                warn!("deployment {} failed: {}", deployment.id, e);
                deployment.status = DeploymentStatus::Failed;
                deployment.details.add_failure("", e.to_string());
            }
        }

        deployment.updated_at = chrono::Utc::now().max(claimed_at + chrono::Duration::microseconds(1));
        let recorded = self
            .deploy_repo
            .update_by_id_if(&deployment, DeploymentStatus::InProgress, claimed_at)
            .await?;
        if !recorded {
            warn!("deployment {} is no longer in progress, dropping the worker result", deployment.id);
            return Ok(());
        }
        info!("deployment {} finished: {}", deployment.id, deployment.status);
        self.publish(&deployment, deployment.status);
        Ok(())
    }

    fn publish(&self, deployment: &JobDeployment, status: DeploymentStatus) {
        if let Some(bus) = &self.bus {
            bus.publish(
                DeploymentEvent::Finished {
                    id: deployment.id,
                    project: deployment.project.clone(),
                    status,
                }
                .into(),
            );
        }
    }
}
