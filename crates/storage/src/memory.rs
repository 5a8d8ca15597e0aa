//! In-memory storage backend.
//!
//! Keeps everything in maps behind a single async mutex, which makes every
//! operation atomic. Used by tests and by offline tooling.

use async_trait::async_trait;
use optimus_core::{
    DeploymentId, DeploymentStatus, JobDeployment, JobId, JobIdDependencyPair, JobSpec,
    NamespaceSpec, ProjectId, ProjectSpec, ReplayId, ReplayMessage, ReplaySpec, ReplayStatus, Time,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::trait_::{
    JobDependencyRepository, JobDeploymentRepository, JobSpecRepository, NamespaceRepository,
    ProjectJobPair, ProjectRepository, ReplaySpecRepository, Result, StorageError,
    UnknownJobDependencyRepository,
};

#[derive(Default)]
struct State {
    projects: BTreeMap<String, ProjectSpec>,
    namespaces: BTreeMap<(String, String), NamespaceSpec>,
    // (project name, job name)
    jobs: BTreeMap<(String, String), JobSpec>,
    dependencies: HashMap<JobId, (String, Vec<JobIdDependencyPair>)>,
    // (project name, job name) -> (inferred urns, static names)
    unknown: BTreeMap<(String, String), (Vec<String>, Vec<String>)>,
    deployments: Vec<JobDeployment>,
    replays: Vec<ReplaySpec>,
}

impl State {
    fn project_of(&self, name: &str) -> Result<ProjectSpec> {
        self.projects
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("project {name}")))
    }

    fn pair(&self, project_name: &str, job: &JobSpec) -> ProjectJobPair {
        // jobs saved without a registered project still carry the name
        let project = self
            .projects
            .get(project_name)
            .cloned()
            .unwrap_or_else(|| ProjectSpec::new(project_name));
        ProjectJobPair {
            project,
            job: job.clone(),
        }
    }
}

/// Storage backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRepository for MemoryStore {
    async fn save(&self, project: &ProjectSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.projects.insert(project.name.clone(), project.clone());
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> Result<ProjectSpec> {
        self.state.lock().await.project_of(name)
    }

    async fn get_all(&self) -> Result<Vec<ProjectSpec>> {
        Ok(self.state.lock().await.projects.values().cloned().collect())
    }
}

#[async_trait]
impl NamespaceRepository for MemoryStore {
    async fn save(&self, namespace: &NamespaceSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.namespaces.insert(
            (namespace.project.name.clone(), namespace.name.clone()),
            namespace.clone(),
        );
        Ok(())
    }

    async fn get_by_name(&self, project: &ProjectSpec, name: &str) -> Result<NamespaceSpec> {
        let state = self.state.lock().await;
        state
            .namespaces
            .get(&(project.name.clone(), name.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("namespace {name} in project {}", project.name)))
    }

    async fn get_all(&self, project: &ProjectSpec) -> Result<Vec<NamespaceSpec>> {
        let state = self.state.lock().await;
        Ok(state
            .namespaces
            .iter()
            .filter(|((p, _), _)| p == &project.name)
            .map(|(_, ns)| ns.clone())
            .collect())
    }
}

#[async_trait]
impl JobSpecRepository for MemoryStore {
    async fn get_all(&self, project: &ProjectSpec) -> Result<Vec<JobSpec>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|((p, _), _)| p == &project.name)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn get_by_name(&self, project: &ProjectSpec, name: &str) -> Result<JobSpec> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&(project.name.clone(), name.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job {name} in project {}", project.name)))
    }

    async fn get_by_name_for_project(&self, project_name: &str, job_name: &str) -> Result<ProjectJobPair> {
        let state = self.state.lock().await;
        let project = state.project_of(project_name)?;
        let job = state
            .jobs
            .get(&(project_name.to_string(), job_name.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("job {job_name} in project {project_name}")))?;
        Ok(ProjectJobPair {
            project,
            job: job.clone(),
        })
    }

    async fn get_by_destination(&self, destination: &str) -> Result<Vec<ProjectJobPair>> {
        let state = self.state.lock().await;
        let pairs: Vec<ProjectJobPair> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.resource_destination == destination)
            .map(|((p, _), job)| state.pair(p, job))
            .collect();
        if pairs.is_empty() {
            return Err(StorageError::NotFound(format!("job with destination {destination}")));
        }
        Ok(pairs)
    }

    async fn get_by_ids(&self, ids: &[JobId]) -> Result<Vec<ProjectJobPair>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|(_, job)| ids.contains(&job.id))
            .map(|((p, _), job)| state.pair(p, job))
            .collect())
    }

    async fn save(&self, project: &ProjectSpec, job: &JobSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .jobs
            .insert((project.name.clone(), job.name.clone()), job.clone());
        Ok(())
    }

    async fn delete(&self, project: &ProjectSpec, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .jobs
            .remove(&(project.name.clone(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("job {name} in project {}", project.name)))
    }
}

#[async_trait]
impl JobDependencyRepository for MemoryStore {
    async fn save(&self, project: &ProjectSpec, job_id: JobId, pairs: &[JobIdDependencyPair]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .dependencies
            .insert(job_id, (project.name.clone(), pairs.to_vec()));
        Ok(())
    }

    async fn get_all(&self, project: &ProjectSpec) -> Result<Vec<JobIdDependencyPair>> {
        let state = self.state.lock().await;
        Ok(state
            .dependencies
            .values()
            .filter(|(p, _)| p == &project.name)
            .flat_map(|(_, pairs)| pairs.iter().cloned())
            .collect())
    }

    async fn delete_by_job_id(&self, job_id: JobId) -> Result<()> {
        self.state.lock().await.dependencies.remove(&job_id);
        Ok(())
    }
}

#[async_trait]
impl UnknownJobDependencyRepository for MemoryStore {
    async fn save(
        &self,
        project: &ProjectSpec,
        job_name: &str,
        inferred_urns: &[String],
        static_names: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (project.name.clone(), job_name.to_string());
        if inferred_urns.is_empty() && static_names.is_empty() {
            state.unknown.remove(&key);
        } else {
            state
                .unknown
                .insert(key, (inferred_urns.to_vec(), static_names.to_vec()));
        }
        Ok(())
    }

    async fn get_unknown_inferred_dependency_urns_by_job_name(
        &self,
        project: &ProjectSpec,
    ) -> Result<HashMap<String, Vec<String>>> {
        let state = self.state.lock().await;
        Ok(state
            .unknown
            .iter()
            .filter(|((p, _), (inferred, _))| p == &project.name && !inferred.is_empty())
            .map(|((_, job), (inferred, _))| (job.clone(), inferred.clone()))
            .collect())
    }

    async fn get_unknown_static_dependency_names_by_job_name(
        &self,
        project: &ProjectSpec,
    ) -> Result<HashMap<String, Vec<String>>> {
        let state = self.state.lock().await;
        Ok(state
            .unknown
            .iter()
            .filter(|((p, _), (_, names))| p == &project.name && !names.is_empty())
            .map(|((_, job), (_, names))| (job.clone(), names.clone()))
            .collect())
    }
}

#[async_trait]
impl JobDeploymentRepository for MemoryStore {
    async fn save(&self, deployment: &JobDeployment) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.deployments.iter().any(|d| d.id == deployment.id) {
            return Err(StorageError::Conflict(format!("deployment {} exists", deployment.id)));
        }
        state.deployments.push(deployment.clone());
        Ok(())
    }

    async fn save_if_not_queued(&self, deployment: &JobDeployment) -> Result<JobDeployment> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.deployments.iter().find(|d| {
            d.project.id == deployment.project.id && d.status == DeploymentStatus::InQueue
        }) {
            debug!("deployment {} already queued for project {}", existing.id, existing.project.name);
            return Ok(existing.clone());
        }
        state.deployments.push(deployment.clone());
        Ok(deployment.clone())
    }

    async fn update_by_id(&self, deployment: &JobDeployment) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .deployments
            .iter_mut()
            .find(|d| d.id == deployment.id)
            .ok_or_else(|| StorageError::NotFound(format!("deployment {}", deployment.id)))?;
        row.status = deployment.status;
        row.details = deployment.details.clone();
        row.updated_at = deployment.updated_at;
        Ok(())
    }

    async fn update_by_id_if(
        &self,
        deployment: &JobDeployment,
        from: DeploymentStatus,
        updated_at: Time,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let row = state
            .deployments
            .iter_mut()
            .find(|d| d.id == deployment.id)
            .ok_or_else(|| StorageError::NotFound(format!("deployment {}", deployment.id)))?;
        if row.status != from || row.updated_at != updated_at {
            return Ok(false);
        }
        row.status = deployment.status;
        row.details = deployment.details.clone();
        row.updated_at = deployment.updated_at;
        Ok(true)
    }

    async fn update_status_if(
        &self,
        id: DeploymentId,
        from: DeploymentStatus,
        updated_at: Time,
        to: DeploymentStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let row = state
            .deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("deployment {id}")))?;
        if row.status != from || row.updated_at != updated_at {
            return Ok(false);
        }
        row.status = to;
        row.updated_at = chrono::Utc::now().max(updated_at + chrono::Duration::microseconds(1));
        Ok(true)
    }

    async fn get_by_id(&self, id: DeploymentId) -> Result<JobDeployment> {
        let state = self.state.lock().await;
        state
            .deployments
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("deployment {id}")))
    }

    async fn get_by_status(&self, status: DeploymentStatus) -> Result<Vec<JobDeployment>> {
        let state = self.state.lock().await;
        let mut rows: Vec<JobDeployment> = state
            .deployments
            .iter()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }

    async fn get_by_status_and_project_id(
        &self,
        status: DeploymentStatus,
        project_id: ProjectId,
    ) -> Result<JobDeployment> {
        let state = self.state.lock().await;
        state
            .deployments
            .iter()
            .find(|d| d.status == status && d.project.id == project_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{status} deployment for project {project_id}")))
    }

    async fn get_first_executable_request(&self) -> Result<JobDeployment> {
        let state = self.state.lock().await;
        state
            .deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::InQueue)
            .min_by_key(|d| d.created_at)
            .cloned()
            .ok_or_else(|| StorageError::NotFound("queued deployment".to_string()))
    }
}

#[async_trait]
impl ReplaySpecRepository for MemoryStore {
    async fn insert(&self, replay: &ReplaySpec) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.replays.iter().any(|r| r.id == replay.id) {
            return Err(StorageError::Conflict(format!("replay {} exists", replay.id)));
        }
        state.replays.push(replay.clone());
        Ok(())
    }

    async fn update_status(&self, id: ReplayId, status: ReplayStatus, message: ReplayMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let replay = state
            .replays
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("replay {id}")))?;
        replay.status = status;
        replay.message = message;
        replay.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn get_by_id(&self, id: ReplayId) -> Result<ReplaySpec> {
        let state = self.state.lock().await;
        state
            .replays
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("replay {id}")))
    }

    async fn get_by_status(&self, statuses: &[ReplayStatus]) -> Result<Vec<ReplaySpec>> {
        let state = self.state.lock().await;
        Ok(state
            .replays
            .iter()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn get_by_project_id_and_status(
        &self,
        project_id: ProjectId,
        statuses: &[ReplayStatus],
    ) -> Result<Vec<ReplaySpec>> {
        let state = self.state.lock().await;
        Ok(state
            .replays
            .iter()
            .filter(|r| r.project.id == project_id && statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn get_by_job_id_and_status(&self, job_id: JobId, statuses: &[ReplayStatus]) -> Result<Vec<ReplaySpec>> {
        let state = self.state.lock().await;
        Ok(state
            .replays
            .iter()
            .filter(|r| r.job.id == job_id && statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn get_by_project_id(&self, project_id: ProjectId) -> Result<Vec<ReplaySpec>> {
        let state = self.state.lock().await;
        let mut replays: Vec<ReplaySpec> = state
            .replays
            .iter()
            .filter(|r| r.project.id == project_id)
            .cloned()
            .collect();
        replays.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(replays)
    }
}
