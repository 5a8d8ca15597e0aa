//! Deployment of one project.
//!
//! A deployment runs in strict phases: fetch the project's jobs, resolve
//! dependencies and hooks, replace the persisted edges with the resolved
//! ones, assign priorities, then upload and clean every namespace. Failures before
//! the upload abort the deployment; a failing namespace does not stop the
//! others.

use optimus_core::{
    group_by_namespace, progress::notify, JobDeploymentDetail, JobSpec, NamespaceSpec, Observer,
    ProgressEvent, ProjectSpec, Scheduler,
};
use optimus_resolver::{DependencyResolver, PriorityResolver};
use optimus_storage::{JobSpecRepository, NamespaceRepository};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};

/// Scheduler jobs with this prefix survive namespace cleanup.
pub const PERSIST_JOB_PREFIX: &str = "__";

/// Deploys every job of a project to the scheduler.
pub struct Deployer {
    dependency_resolver: Arc<DependencyResolver>,
    priority_resolver: PriorityResolver,
    scheduler: Arc<dyn Scheduler>,
    job_repo: Arc<dyn JobSpecRepository>,
    namespace_repo: Arc<dyn NamespaceRepository>,
}

impl Deployer {
    /// Create a deployer.
    pub fn new(
        dependency_resolver: Arc<DependencyResolver>,
        scheduler: Arc<dyn Scheduler>,
        job_repo: Arc<dyn JobSpecRepository>,
        namespace_repo: Arc<dyn NamespaceRepository>,
    ) -> Self {
        Self {
            dependency_resolver,
            priority_resolver: PriorityResolver::new(),
            scheduler,
            job_repo,
            namespace_repo,
        }
    }

    /// Deploy all jobs of `project`.
    ///
    /// Returns [`DeployError::Namespaces`] carrying the partial outcome when
    /// some namespaces failed.
    pub async fn deploy(
        &self,
        project: &ProjectSpec,
        observer: Option<&dyn Observer>,
    ) -> Result<JobDeploymentDetail> {
        let jobs = self.job_repo.get_all(project).await?;
        debug!("fetched {} jobs of project {}", jobs.len(), project.name);

        let resolution = self.dependency_resolver.resolve(project, jobs, observer).await?;
        self.dependency_resolver.persist(project, &resolution.jobs).await?;
        debug!("dependencies resolved for project {}", project.name);

        let jobs = self.priority_resolver.resolve(resolution.jobs, observer)?;
        debug!("priorities resolved for project {}", project.name);

        let mut detail = JobDeploymentDetail {
            unknown_dependencies: resolution.unknown_dependencies,
            ..Default::default()
        };
        let mut errors = Vec::new();

        for (namespace_name, jobs) in group_by_namespace(jobs) {
            let namespace = match self.namespace_repo.get_by_name(project, &namespace_name).await {
                Ok(namespace) => namespace,
                Err(e) => {
                    warn!("namespace {} of project {} not loaded: {}", namespace_name, project.name, e);
                    detail.add_failure("", format!("namespace {namespace_name}: {e}"));
                    errors.push(e.into());
                    continue;
                }
            };

            match self.scheduler.deploy_jobs(&namespace, &jobs, observer).await {
                Ok(namespace_detail) => {
                    notify(
                        observer,
                        ProgressEvent::NamespaceDeployed {
                            namespace: namespace.name.clone(),
                            success_count: namespace_detail.success_count,
                            failure_count: namespace_detail.failure_count,
                        },
                    );
                    detail.merge(namespace_detail);
                }
                Err(source) => {
                    detail.add_failure("", format!("namespace {}: {}", namespace.name, source));
                    errors.push(DeployError::Scheduler {
                        namespace: namespace.name.clone(),
                        source,
                    });
                    continue;
                }
            }

            if let Err(e) = self.clean_namespace(&namespace, &jobs, observer).await {
                errors.push(e);
            }
            debug!("namespace {} deployed", namespace.name);
        }

        info!(
            "deployed project {}: {} succeeded, {} failed",
            project.name, detail.success_count, detail.failure_count
        );
        if errors.is_empty() {
            Ok(detail)
        } else {
            Err(DeployError::Namespaces { errors, detail })
        }
    }

    /// Remove scheduler jobs of a namespace that are no longer declared.
    async fn clean_namespace(
        &self,
        namespace: &NamespaceSpec,
        jobs: &[JobSpec],
        observer: Option<&dyn Observer>,
    ) -> Result<()> {
        let declared: HashSet<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        let deployed = self
            .scheduler
            .list_jobs(namespace)
            .await
            .map_err(|source| DeployError::Scheduler {
                namespace: namespace.name.clone(),
                source,
            })?;

        let stale: Vec<String> = deployed
            .into_iter()
            .filter(|name| !declared.contains(name.as_str()) && !name.starts_with(PERSIST_JOB_PREFIX))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        self.scheduler
            .delete_jobs(namespace, &stale, observer)
            .await
            .map_err(|source| DeployError::Scheduler {
                namespace: namespace.name.clone(),
                source,
            })?;
        info!("deleted {} stale jobs from namespace {}", stale.len(), namespace.name);
        notify(
            observer,
            ProgressEvent::JobsCleaned {
                namespace: namespace.name.clone(),
                jobs: stale,
            },
        );
        Ok(())
    }
}
