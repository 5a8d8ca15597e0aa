//! Dependency resolution.
//!
//! Fills every job's dependency map so that each entry names a concrete
//! upstream: a job of the same project, a job of another project on this
//! control plane, a job on another control plane, or an HTTP sensor.

use optimus_core::{
    progress::notify, split_project_job_name, DependencyType, JobDependency, JobId, JobIdDependencyPair,
    JobRef, JobSpec, Observer, ProgressEvent, ProjectRef, ProjectSpec, UnknownDependency,
};
use optimus_storage::{
    JobDependencyRepository, JobSpecRepository, ProjectJobPair, UnknownJobDependencyRepository,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ResolveError, Result};
use crate::external::ExternalDependencyResolver;
use crate::plugin::{PluginRegistry, PluginRequest};

/// Resolved jobs and what could not be resolved.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Jobs with resolved dependency maps, in input order
    pub jobs: Vec<JobSpec>,
    /// Static dependencies that matched nothing anywhere
    pub unknown_dependencies: Vec<UnknownDependency>,
}

#[derive(Default)]
struct Unresolved {
    // job name -> urns / names
    inferred: BTreeMap<String, Vec<String>>,
    statics: BTreeMap<String, Vec<String>>,
}

/// Resolves inferred, static and hook dependencies of a project's jobs.
pub struct DependencyResolver {
    registry: Arc<PluginRegistry>,
    job_repo: Arc<dyn JobSpecRepository>,
    dependency_repo: Option<Arc<dyn JobDependencyRepository>>,
    unknown_repo: Option<Arc<dyn UnknownJobDependencyRepository>>,
    external: ExternalDependencyResolver,
}

impl DependencyResolver {
    /// Create a resolver without external resource managers.
    pub fn new(registry: Arc<PluginRegistry>, job_repo: Arc<dyn JobSpecRepository>) -> Self {
        Self {
            registry,
            job_repo,
            dependency_repo: None,
            unknown_repo: None,
            external: ExternalDependencyResolver::default(),
        }
    }

    /// Query these resource managers for names nothing local claims.
    pub fn with_external(mut self, external: ExternalDependencyResolver) -> Self {
        self.external = external;
        self
    }

    /// Persist resolved edges into this repository.
    pub fn with_dependency_repository(mut self, repo: Arc<dyn JobDependencyRepository>) -> Self {
        self.dependency_repo = Some(repo);
        self
    }

    /// Record unresolved names into this repository.
    pub fn with_unknown_repository(mut self, repo: Arc<dyn UnknownJobDependencyRepository>) -> Self {
        self.unknown_repo = Some(repo);
        self
    }

    /// Resolve every job of a project.
    ///
    /// `jobs` must hold all jobs of `project`; static local names are looked
    /// up among them.
    pub async fn resolve(
        &self,
        project: &ProjectSpec,
        mut jobs: Vec<JobSpec>,
        observer: Option<&dyn Observer>,
    ) -> Result<Resolution> {
        self.resolve_destinations(project, &mut jobs).await?;

        let local: HashMap<String, JobRef> = jobs.iter().map(|j| (j.name.clone(), j.to_ref())).collect();
        let mut by_destination: HashMap<String, JobRef> = HashMap::new();
        for job in &jobs {
            if !job.resource_destination.is_empty() {
                by_destination.insert(job.resource_destination.clone(), job.to_ref());
            }
        }

        let mut unresolved = Unresolved::default();
        for job in jobs.iter_mut() {
            self.resolve_inferred_dependencies(project, job, &by_destination, &mut unresolved)
                .await?;
            self.resolve_static_dependencies(project, job, &local, &mut unresolved)
                .await?;
            self.resolve_hook_dependencies(job, observer);
        }

        self.record_unresolved(project, &jobs, &unresolved).await?;
        let unknown_dependencies = self
            .resolve_external(&mut jobs, &unresolved, observer)
            .await?;

        for job in &jobs {
            notify(observer, ProgressEvent::DependencyResolved { job: job.name.clone() });
        }
        info!(
            "resolved dependencies of {} jobs in project {}",
            jobs.len(),
            project.name
        );

        Ok(Resolution {
            jobs,
            unknown_dependencies,
        })
    }

    /// Bind each hook's `depends_on` names to earlier hooks of the job.
    ///
    /// Hooks declaring nothing use their plugin's default ordering. Names
    /// that match no earlier hook are reported and dropped.
    pub fn resolve_hook_dependencies(&self, job: &mut JobSpec, observer: Option<&dyn Observer>) {
        let names: Vec<String> = job.hooks.iter().map(|h| h.name.clone()).collect();
        for (position, hook) in job.hooks.iter_mut().enumerate() {
            let depends_on = if hook.depends_on.is_empty() {
                self.registry
                    .get_hook(&hook.name)
                    .map(|plugin| plugin.depends_on())
                    .unwrap_or_default()
            } else {
                hook.depends_on.clone()
            };

            hook.resolved_depends_on.clear();
            for name in depends_on {
                match names[..position].iter().position(|n| *n == name) {
                    Some(index) => hook.resolved_depends_on.push(index),
                    None => {
                        warn!("hook {} of job {} depends on unknown hook {}", hook.name, job.name, name);
                        notify(
                            observer,
                            ProgressEvent::HookDependencyUnresolved {
                                job: job.name.clone(),
                                hook: hook.name.clone(),
                                depends_on: name,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Replace the persisted edges of each job with its resolved ones.
    pub async fn persist(&self, project: &ProjectSpec, jobs: &[JobSpec]) -> Result<()> {
        let Some(repo) = &self.dependency_repo else {
            return Ok(());
        };
        for job in jobs {
            let pairs: Vec<JobIdDependencyPair> = job
                .dependencies
                .values()
                .filter(|d| matches!(d.dependency_type, DependencyType::Intra | DependencyType::Inter))
                .filter_map(|d| match (&d.job, &d.project) {
                    (Some(upstream), Some(upstream_project)) => Some(JobIdDependencyPair {
                        job_id: job.id,
                        dependent_project: upstream_project.clone(),
                        dependent_job_id: upstream.id,
                        dependency_type: d.dependency_type,
                    }),
                    _ => None,
                })
                .collect();
            repo.delete_by_job_id(job.id).await?;
            repo.save(project, job.id, &pairs).await?;
        }
        debug!("persisted dependencies of {} jobs in project {}", jobs.len(), project.name);
        Ok(())
    }

    async fn resolve_destinations(&self, project: &ProjectSpec, jobs: &mut [JobSpec]) -> Result<()> {
        for job in jobs.iter_mut() {
            let Some(plugin) = self.registry.get_task(&job.task.plugin) else {
                debug!("task {} of job {} does not infer destinations", job.task.plugin, job.name);
                continue;
            };
            let request = PluginRequest {
                config: &job.task.config,
                assets: &job.assets,
                project,
            };
            let destination = plugin
                .generate_destination(request)
                .await
                .map_err(|e| ResolveError::Plugin {
                    plugin: job.task.plugin.clone(),
                    job: job.name.clone(),
                    reason: e.to_string(),
                })?;
            job.resource_destination = destination.urn();
        }
        Ok(())
    }

    async fn resolve_inferred_dependencies(
        &self,
        project: &ProjectSpec,
        job: &mut JobSpec,
        by_destination: &HashMap<String, JobRef>,
        unresolved: &mut Unresolved,
    ) -> Result<()> {
        let Some(plugin) = self.registry.get_task(&job.task.plugin) else {
            return Ok(());
        };
        let request = PluginRequest {
            config: &job.task.config,
            assets: &job.assets,
            project,
        };
        let urns = plugin
            .generate_dependencies(request)
            .await
            .map_err(|e| ResolveError::Plugin {
                plugin: job.task.plugin.clone(),
                job: job.name.clone(),
                reason: e.to_string(),
            })?;

        for urn in urns {
            if let Some(upstream) = by_destination.get(&urn) {
                if upstream.name == job.name {
                    continue;
                }
                job.dependencies.insert(
                    upstream.name.clone(),
                    JobDependency::resolved(upstream.clone(), project.to_ref(), DependencyType::Intra),
                );
                continue;
            }

            match self.job_repo.get_by_destination(&urn).await {
                Ok(pairs) => {
                    if let Some((key, dependency)) = extract_dependency(&pairs, project) {
                        job.dependencies.insert(key, dependency);
                    }
                }
                Err(e) if e.is_not_found() => {
                    debug!("destination {} of job {} is not claimed locally", urn, job.name);
                    unresolved.inferred.entry(job.name.clone()).or_default().push(urn);
                }
                Err(e) => {
                    return Err(ResolveError::UnknownRuntimeDependency {
                        destination: urn,
                        job: job.name.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn resolve_static_dependencies(
        &self,
        project: &ProjectSpec,
        job: &mut JobSpec,
        local: &HashMap<String, JobRef>,
        unresolved: &mut Unresolved,
    ) -> Result<()> {
        let pending: Vec<String> = job
            .dependencies
            .iter()
            .filter(|(_, d)| d.is_unresolved())
            .map(|(name, _)| name.clone())
            .collect();

        for name in pending {
            match split_project_job_name(&name) {
                None => {
                    let upstream = local.get(&name).ok_or_else(|| ResolveError::UnknownLocalDependency {
                        dependency: name.clone(),
                        job: job.name.clone(),
                    })?;
                    job.dependencies.insert(
                        name.clone(),
                        JobDependency::resolved(upstream.clone(), project.to_ref(), DependencyType::Intra),
                    );
                }
                Some(Err(_)) => {
                    return Err(ResolveError::InvalidStaticDependency {
                        job: job.name.clone(),
                        names: name,
                    })
                }
                Some(Ok((project_name, job_name))) => {
                    if project_name == project.name {
                        if let Some(upstream) = local.get(job_name) {
                            job.dependencies.insert(
                                name.clone(),
                                JobDependency::resolved(upstream.clone(), project.to_ref(), DependencyType::Intra),
                            );
                            continue;
                        }
                    }
                    match self.job_repo.get_by_name_for_project(project_name, job_name).await {
                        Ok(pair) => {
                            job.dependencies.insert(
                                name.clone(),
                                JobDependency::resolved(pair.job.to_ref(), pair.project.to_ref(), DependencyType::Inter),
                            );
                        }
                        Err(e) if e.is_not_found() => {
                            unresolved
                                .statics
                                .entry(job.name.clone())
                                .or_default()
                                .push(name.clone());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_unresolved(
        &self,
        project: &ProjectSpec,
        jobs: &[JobSpec],
        unresolved: &Unresolved,
    ) -> Result<()> {
        let Some(repo) = &self.unknown_repo else {
            return Ok(());
        };
        for job in jobs {
            let inferred = unresolved.inferred.get(&job.name).cloned().unwrap_or_default();
            let statics = unresolved.statics.get(&job.name).cloned().unwrap_or_default();
            repo.save(project, &job.name, &inferred, &statics).await?;
        }
        Ok(())
    }

    async fn resolve_external(
        &self,
        jobs: &mut [JobSpec],
        unresolved: &Unresolved,
        observer: Option<&dyn Observer>,
    ) -> Result<Vec<UnknownDependency>> {
        let mut unknown = Vec::new();
        if unresolved.inferred.is_empty() && unresolved.statics.is_empty() {
            return Ok(unknown);
        }
        let index: HashMap<String, usize> = jobs.iter().enumerate().map(|(i, j)| (j.name.clone(), i)).collect();

        let inferred = self.external.resolve_inferred(&unresolved.inferred).await?;
        if let Some((job, urn)) = inferred.undefined_destinations.first() {
            for (job, urn) in &inferred.undefined_destinations {
                notify(
                    observer,
                    ProgressEvent::UnknownDependencyUsed {
                        job: job.clone(),
                        dependency: urn.clone(),
                    },
                );
            }
            return Err(ResolveError::UndefinedDestination {
                destination: urn.clone(),
                job: job.clone(),
            });
        }
        for (job_name, external) in inferred.dependencies {
            if let Some(&i) = index.get(&job_name) {
                jobs[i].external_dependencies.merge(external);
            }
        }

        let statics = self.external.resolve_static(&unresolved.statics).await?;
        for (job_name, external) in statics.dependencies {
            let Some(&i) = index.get(&job_name) else { continue };
            for dependency in &external.optimus_dependencies {
                let name = format!("{}/{}", dependency.project_name, dependency.job_name);
                jobs[i].dependencies.insert(
                    name,
                    JobDependency::resolved(
                        JobRef {
                            id: JobId::nil(),
                            name: dependency.job_name.clone(),
                        },
                        ProjectRef::external(dependency.project_name.clone()),
                        DependencyType::Extra,
                    ),
                );
            }
            jobs[i].external_dependencies.merge(external);
        }
        for dependency in statics.unknown_dependencies {
            if let Some(&i) = index.get(&dependency.job_name) {
                let name = format!(
                    "{}/{}",
                    dependency.dependency_project_name, dependency.dependency_job_name
                );
                jobs[i].dependencies.remove(&name);
            }
            warn!(
                "static dependency {}/{} of job {} is unknown",
                dependency.dependency_project_name, dependency.dependency_job_name, dependency.job_name
            );
            notify(
                observer,
                ProgressEvent::UnknownDependencyUsed {
                    job: dependency.job_name.clone(),
                    dependency: format!(
                        "{}/{}",
                        dependency.dependency_project_name, dependency.dependency_job_name
                    ),
                },
            );
            unknown.push(dependency);
        }
        Ok(unknown)
    }
}

/// Pick the upstream among jobs claiming the same destination.
///
/// A job of the current project wins; otherwise the first one is taken.
fn extract_dependency(pairs: &[ProjectJobPair], project: &ProjectSpec) -> Option<(String, JobDependency)> {
    if let Some(pair) = pairs.iter().find(|p| p.project.name == project.name) {
        return Some((
            pair.job.name.clone(),
            JobDependency::resolved(pair.job.to_ref(), pair.project.to_ref(), DependencyType::Intra),
        ));
    }
    pairs.first().map(|pair| {
        (
            format!("{}/{}", pair.project.name, pair.job.name),
            JobDependency::resolved(pair.job.to_ref(), pair.project.to_ref(), DependencyType::Inter),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Destination, HookPlugin, PluginError, TaskPlugin};
    use crate::resource_manager::ResourceManager;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use optimus_core::{JobHook, JobSpecFilter, OptimusDependency};
    use optimus_storage::{MemoryStore, ProjectRepository};

    /// Reads `DEST` and comma separated `SOURCES` from the task config.
    struct FakeTask;

    #[async_trait]
    impl TaskPlugin for FakeTask {
        fn name(&self) -> &str {
            "bq2bq"
        }

        async fn generate_destination(&self, request: PluginRequest<'_>) -> std::result::Result<Destination, PluginError> {
            request
                .config
                .get("DEST")
                .map(|d| Destination::new("bigquery", d.clone()))
                .ok_or_else(|| PluginError("missing DEST".to_string()))
        }

        async fn generate_dependencies(&self, request: PluginRequest<'_>) -> std::result::Result<Vec<String>, PluginError> {
            Ok(request
                .config
                .get("SOURCES")
                .map(|s| s.split(',').map(|u| format!("bigquery://{u}")).collect())
                .unwrap_or_default())
        }
    }

    struct Predator;

    impl HookPlugin for Predator {
        fn name(&self) -> &str {
            "predator"
        }

        fn depends_on(&self) -> Vec<String> {
            vec!["transporter".to_string()]
        }
    }

    struct FakeManager;

    #[async_trait]
    impl ResourceManager for FakeManager {
        fn name(&self) -> &str {
            "other-optimus"
        }

        async fn get_optimus_dependencies(&self, filter: &JobSpecFilter) -> Result<Vec<OptimusDependency>> {
            if filter.project_name == "external" && filter.job_name == "upstream" {
                return Ok(vec![OptimusDependency {
                    name: "other-optimus".to_string(),
                    host: "http://other".to_string(),
                    headers: Default::default(),
                    project_name: "external".to_string(),
                    namespace_name: "ns".to_string(),
                    job_name: "upstream".to_string(),
                    task_name: "bq2bq".to_string(),
                }]);
            }
            Ok(vec![])
        }
    }

    fn create_test_job(name: &str, dest: &str, sources: &str) -> JobSpec {
        let mut job = JobSpec::new(name, "bq2bq", NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        job.task.config.insert("DEST".to_string(), dest.to_string());
        if !sources.is_empty() {
            job.task.config.insert("SOURCES".to_string(), sources.to_string());
        }
        job
    }

    fn create_test_resolver(store: Arc<MemoryStore>) -> DependencyResolver {
        let registry = PluginRegistry::new()
            .with_task(Arc::new(FakeTask))
            .with_hook(Arc::new(Predator));
        DependencyResolver::new(Arc::new(registry), store.clone())
            .with_dependency_repository(store.clone())
            .with_unknown_repository(store)
    }

    #[tokio::test]
    async fn test_inferred_and_static_local_dependencies() {
        let store = Arc::new(MemoryStore::new());
        let resolver = create_test_resolver(store);
        let project = ProjectSpec::new("p1");

        let jobs = vec![
            create_test_job("a", "p1:ds.a", ""),
            create_test_job("b", "p1:ds.b", "p1:ds.a"),
            create_test_job("c", "p1:ds.c", "").with_dependency("b"),
        ];

        let resolution = resolver.resolve(&project, jobs, None).await.unwrap();
        let jobs = resolution.jobs;

        assert_eq!(jobs[0].resource_destination, "bigquery://p1:ds.a");
        let dep = &jobs[1].dependencies["a"];
        assert_eq!(dep.dependency_type, DependencyType::Intra);
        assert_eq!(dep.job.as_ref().unwrap().id, jobs[0].id);
        assert_eq!(jobs[2].dependencies["b"].job.as_ref().unwrap().name, "b");
        assert!(resolution.unknown_dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_local_dependency() {
        let store = Arc::new(MemoryStore::new());
        let resolver = create_test_resolver(store);
        let project = ProjectSpec::new("p1");

        let jobs = vec![create_test_job("a", "p1:ds.a", "").with_dependency("ghost")];
        let err = resolver.resolve(&project, jobs, None).await.unwrap_err();

        assert!(matches!(err, ResolveError::UnknownLocalDependency { .. }));
        assert!(err.to_string().contains("unknown local dependency for job ghost"));
    }

    #[tokio::test]
    async fn test_inter_project_dependencies() {
        let store = Arc::new(MemoryStore::new());
        let other = ProjectSpec::new("p2");
        ProjectRepository::save(store.as_ref(), &other).await.unwrap();
        let mut upstream = create_test_job("x", "p2:ds.x", "");
        upstream.resource_destination = "bigquery://p2:ds.x".to_string();
        JobSpecRepository::save(store.as_ref(), &other, &upstream).await.unwrap();

        let resolver = create_test_resolver(store.clone());
        let project = ProjectSpec::new("p1");
        let jobs = vec![
            create_test_job("a", "p1:ds.a", "p2:ds.x"),
            create_test_job("b", "p1:ds.b", "").with_dependency("p2/x"),
        ];

        let resolution = resolver.resolve(&project, jobs, None).await.unwrap();

        let inferred = &resolution.jobs[0].dependencies["p2/x"];
        assert_eq!(inferred.dependency_type, DependencyType::Inter);
        assert_eq!(inferred.project.as_ref().unwrap().name, "p2");
        let declared = &resolution.jobs[1].dependencies["p2/x"];
        assert_eq!(declared.job.as_ref().unwrap().id, upstream.id);

        resolver.persist(&project, &resolution.jobs).await.unwrap();
        let pairs = JobDependencyRepository::get_all(store.as_ref(), &project).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.dependent_job_id == upstream.id));
    }

    #[tokio::test]
    async fn test_undefined_inferred_destination_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let resolver = create_test_resolver(store.clone());
        let project = ProjectSpec::new("p1");
        let observer = recorder::Recorder::default();

        let jobs = vec![create_test_job("a", "p1:ds.a", "raw:ds.events")];
        let err = resolver.resolve(&project, jobs, Some(&observer)).await.unwrap_err();

        assert!(matches!(err, ResolveError::UndefinedDestination { .. }));
        assert!(observer.contains("bigquery://raw:ds.events"));
        let recorded = store
            .get_unknown_inferred_dependency_urns_by_job_name(&project)
            .await
            .unwrap();
        assert_eq!(recorded["a"], vec!["bigquery://raw:ds.events".to_string()]);
    }

    #[tokio::test]
    async fn test_static_external_dependencies() {
        let store = Arc::new(MemoryStore::new());
        let resolver = create_test_resolver(store)
            .with_external(ExternalDependencyResolver::new(vec![Arc::new(FakeManager)]));
        let project = ProjectSpec::new("p1");

        let jobs = vec![create_test_job("a", "p1:ds.a", "")
            .with_dependency("external/upstream")
            .with_dependency("external/gone")];
        let resolution = resolver.resolve(&project, jobs, None).await.unwrap();

        let job = &resolution.jobs[0];
        let dep = &job.dependencies["external/upstream"];
        assert_eq!(dep.dependency_type, DependencyType::Extra);
        assert!(dep.project.as_ref().unwrap().id.is_nil());
        assert!(!job.dependencies.contains_key("external/gone"));
        assert_eq!(job.external_dependencies.optimus_dependencies.len(), 1);
        assert_eq!(resolution.unknown_dependencies.len(), 1);
        assert_eq!(resolution.unknown_dependencies[0].dependency_job_name, "gone");
    }

    #[tokio::test]
    async fn test_hook_dependencies() {
        let store = Arc::new(MemoryStore::new());
        let resolver = create_test_resolver(store);
        let observer = recorder::Recorder::default();

        let mut job = create_test_job("a", "p1:ds.a", "")
            .with_hook(JobHook::new("transporter"))
            .with_hook(JobHook::new("predator"))
            .with_hook(JobHook::new("notifier").depends_on("missing"));
        resolver.resolve_hook_dependencies(&mut job, Some(&observer));

        assert!(job.hooks[0].resolved_depends_on.is_empty());
        assert_eq!(job.hooks[1].resolved_depends_on, vec![0]);
        assert!(job.hooks[2].resolved_depends_on.is_empty());
        assert!(observer.contains("missing"));
    }

    mod recorder {
        use optimus_core::{Observer, ProgressEvent};
        use std::sync::Mutex;

        #[derive(Default)]
        pub struct Recorder {
            events: Mutex<Vec<ProgressEvent>>,
        }

        impl Recorder {
            pub fn contains(&self, needle: &str) -> bool {
                self.events
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|e| e.to_string().contains(needle))
            }
        }

        impl Observer for Recorder {
            fn notify(&self, event: ProgressEvent) {
                self.events.lock().unwrap().push(event);
            }
        }
    }
}
