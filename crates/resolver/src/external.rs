//! Resolution of dependencies owned by other control planes.
//!
//! Names and URNs that nothing on this control plane claims are looked up on
//! every configured resource manager. Static names that resolve nowhere are
//! reported back; inferred URNs that resolve nowhere are listed as undefined
//! so the caller can fail the deployment.

use optimus_core::{
    split_project_job_name, ExternalDependency, JobSpecFilter, OptimusDependency, ProjectSpec,
    ResourceManagerConfig, UnknownDependency,
};
use optimus_storage::UnknownJobDependencyRepository;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ResolveError, Result};
use crate::resource_manager::{OptimusResourceManager, ResourceManager};

/// Outcome of an external lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalResolution {
    /// External upstream jobs keyed by dependent job name
    pub dependencies: HashMap<String, ExternalDependency>,
    /// Static names that matched nothing
    pub unknown_dependencies: Vec<UnknownDependency>,
    /// Inferred URNs that matched nothing, as `(job, urn)`
    pub undefined_destinations: Vec<(String, String)>,
}

/// Queries resource managers for unresolved dependencies.
#[derive(Clone, Default)]
pub struct ExternalDependencyResolver {
    managers: Vec<Arc<dyn ResourceManager>>,
    unknown_repo: Option<Arc<dyn UnknownJobDependencyRepository>>,
}

impl ExternalDependencyResolver {
    /// Build a resolver from configuration.
    ///
    /// Fails on resource manager kinds other than `optimus`.
    pub fn from_config(configs: &[ResourceManagerConfig]) -> Result<Self> {
        let mut managers: Vec<Arc<dyn ResourceManager>> = Vec::with_capacity(configs.len());
        for config in configs {
            managers.push(Arc::new(OptimusResourceManager::new(config)?));
        }
        Ok(Self {
            managers,
            unknown_repo: None,
        })
    }

    /// Build a resolver over explicit managers.
    pub fn new(managers: Vec<Arc<dyn ResourceManager>>) -> Self {
        Self {
            managers,
            unknown_repo: None,
        }
    }

    /// Read unresolved names of a project from a repository.
    pub fn with_unknown_repository(mut self, repo: Arc<dyn UnknownJobDependencyRepository>) -> Self {
        self.unknown_repo = Some(repo);
        self
    }

    /// Whether any resource manager is configured.
    pub fn has_managers(&self) -> bool {
        !self.managers.is_empty()
    }

    /// Resolve inferred URNs keyed by dependent job name.
    pub async fn resolve_inferred(&self, urns_per_job: &BTreeMap<String, Vec<String>>) -> Result<ExternalResolution> {
        let mut resolution = ExternalResolution::default();
        for (job_name, urns) in urns_per_job {
            let mut found = Vec::new();
            for urn in urns {
                let filter = JobSpecFilter {
                    resource_destination: urn.clone(),
                    ..Default::default()
                };
                let dependencies = self.fetch_per_filter(&filter).await?;
                if dependencies.is_empty() {
                    resolution
                        .undefined_destinations
                        .push((job_name.clone(), urn.clone()));
                }
                found.extend(dependencies);
            }
            resolution.dependencies.insert(
                job_name.clone(),
                ExternalDependency {
                    optimus_dependencies: found,
                },
            );
        }
        Ok(resolution)
    }

    /// Resolve static `project/job` names keyed by dependent job name.
    pub async fn resolve_static(&self, names_per_job: &BTreeMap<String, Vec<String>>) -> Result<ExternalResolution> {
        let filters_per_job = to_filters(names_per_job)?;

        let mut resolution = ExternalResolution::default();
        for (job_name, filters) in filters_per_job {
            let mut found = Vec::new();
            for filter in filters {
                let dependencies = self.fetch_per_filter(&filter).await?;
                if dependencies.is_empty() {
                    resolution.unknown_dependencies.push(UnknownDependency {
                        job_name: job_name.clone(),
                        dependency_project_name: filter.project_name.clone(),
                        dependency_job_name: filter.job_name.clone(),
                    });
                    continue;
                }
                found.extend(dependencies);
            }
            resolution.dependencies.insert(
                job_name,
                ExternalDependency {
                    optimus_dependencies: found,
                },
            );
        }
        Ok(resolution)
    }

    /// Resolve the inferred URNs recorded as unknown for a project.
    pub async fn fetch_inferred_external_dependencies_per_job_name(
        &self,
        project: &ProjectSpec,
    ) -> Result<ExternalResolution> {
        let Some(repo) = &self.unknown_repo else {
            return Ok(ExternalResolution::default());
        };
        let urns = repo
            .get_unknown_inferred_dependency_urns_by_job_name(project)
            .await?;
        self.resolve_inferred(&urns.into_iter().collect()).await
    }

    /// Resolve the static names recorded as unknown for a project.
    pub async fn fetch_static_external_dependencies_per_job_name(
        &self,
        project: &ProjectSpec,
    ) -> Result<ExternalResolution> {
        let Some(repo) = &self.unknown_repo else {
            return Ok(ExternalResolution::default());
        };
        let names = repo
            .get_unknown_static_dependency_names_by_job_name(project)
            .await?;
        self.resolve_static(&names.into_iter().collect()).await
    }

    async fn fetch_per_filter(&self, filter: &JobSpecFilter) -> Result<Vec<OptimusDependency>> {
        let lookups = self.managers.iter().map(|manager| async move {
            let found = manager.get_optimus_dependencies(filter).await?;
            debug!("resource manager {} matched {} jobs", manager.name(), found.len());
            Ok::<_, ResolveError>(found)
        });
        let found = futures::future::try_join_all(lookups).await?;
        Ok(found.into_iter().flatten().collect())
    }
}

fn to_filters(names_per_job: &BTreeMap<String, Vec<String>>) -> Result<BTreeMap<String, Vec<JobSpecFilter>>> {
    let mut output = BTreeMap::new();
    let mut invalid: Vec<(String, Vec<String>)> = Vec::new();

    for (job_name, names) in names_per_job {
        let mut filters = Vec::new();
        let mut bad = Vec::new();
        for name in names {
            match split_project_job_name(name) {
                Some(Ok((project_name, job))) => filters.push(JobSpecFilter {
                    project_name: project_name.to_string(),
                    job_name: job.to_string(),
                    ..Default::default()
                }),
                _ => bad.push(name.clone()),
            }
        }
        if bad.is_empty() {
            output.insert(job_name.clone(), filters);
        } else {
            invalid.push((job_name.clone(), bad));
        }
    }

    match invalid.into_iter().next() {
        None => Ok(output),
        Some((job, names)) => Err(ResolveError::InvalidStaticDependency {
            job,
            names: names.join(", "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use optimus_storage::MemoryStore;

    struct FakeManager {
        jobs: Vec<OptimusDependency>,
    }

    #[async_trait]
    impl ResourceManager for FakeManager {
        fn name(&self) -> &str {
            "fake"
        }

        async fn get_optimus_dependencies(&self, filter: &JobSpecFilter) -> Result<Vec<OptimusDependency>> {
            Ok(self
                .jobs
                .iter()
                .filter(|job| {
                    (filter.project_name.is_empty() || filter.project_name == job.project_name)
                        && (filter.job_name.is_empty() || filter.job_name == job.job_name)
                        && (filter.resource_destination.is_empty()
                            || filter.resource_destination == format!("bigquery://{}", job.job_name))
                })
                .cloned()
                .collect())
        }
    }

    fn create_test_dependency(project: &str, job: &str) -> OptimusDependency {
        OptimusDependency {
            name: "fake".to_string(),
            host: "http://fake".to_string(),
            headers: BTreeMap::new(),
            project_name: project.to_string(),
            namespace_name: "ns".to_string(),
            job_name: job.to_string(),
            task_name: "bq2bq".to_string(),
        }
    }

    fn create_test_resolver() -> ExternalDependencyResolver {
        ExternalDependencyResolver::new(vec![Arc::new(FakeManager {
            jobs: vec![create_test_dependency("other", "upstream")],
        })])
    }

    #[tokio::test]
    async fn test_static_names_split_found_and_unknown() {
        let resolver = create_test_resolver();
        let names = BTreeMap::from([(
            "job-a".to_string(),
            vec!["other/upstream".to_string(), "other/missing".to_string()],
        )]);

        let resolution = resolver.resolve_static(&names).await.unwrap();

        assert_eq!(resolution.dependencies["job-a"].optimus_dependencies.len(), 1);
        assert_eq!(
            resolution.unknown_dependencies,
            vec![UnknownDependency {
                job_name: "job-a".to_string(),
                dependency_project_name: "other".to_string(),
                dependency_job_name: "missing".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_invalid_static_names_are_rejected() {
        let resolver = create_test_resolver();
        let names = BTreeMap::from([("job-a".to_string(), vec!["a/b/c".to_string()])]);

        let err = resolver.resolve_static(&names).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid static dependency names for [job-a]: a/b/c");
    }

    #[tokio::test]
    async fn test_inferred_urns_report_undefined() {
        let resolver = create_test_resolver();
        let urns = BTreeMap::from([(
            "job-a".to_string(),
            vec!["bigquery://upstream".to_string(), "bigquery://nowhere".to_string()],
        )]);

        let resolution = resolver.resolve_inferred(&urns).await.unwrap();

        assert_eq!(resolution.dependencies["job-a"].optimus_dependencies[0].job_name, "upstream");
        assert_eq!(
            resolution.undefined_destinations,
            vec![("job-a".to_string(), "bigquery://nowhere".to_string())]
        );
    }

    #[tokio::test]
    async fn test_fetch_from_unknown_repository() {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectSpec::new("p1");
        UnknownJobDependencyRepository::save(
            store.as_ref(),
            &project,
            "job-a",
            &[],
            &["other/upstream".to_string()],
        )
        .await
        .unwrap();

        let resolver = create_test_resolver().with_unknown_repository(store);
        let resolution = resolver
            .fetch_static_external_dependencies_per_job_name(&project)
            .await
            .unwrap();
        assert!(resolution.unknown_dependencies.is_empty());
        assert_eq!(resolution.dependencies.len(), 1);

        let inferred = resolver
            .fetch_inferred_external_dependencies_per_job_name(&project)
            .await
            .unwrap();
        assert!(inferred.dependencies.is_empty());
    }

    #[test]
    fn test_from_config_rejects_unknown_kind() {
        let config = ResourceManagerConfig {
            name: "x".to_string(),
            manager_type: "unknown".to_string(),
            config: Default::default(),
        };
        assert!(matches!(
            ExternalDependencyResolver::from_config(&[config]),
            Err(ResolveError::UnknownResourceManager(_))
        ));
    }
}
