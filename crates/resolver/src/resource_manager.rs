//! Clients for external control planes.

use async_trait::async_trait;
use optimus_core::{JobSpecFilter, OptimusDependency, ResourceManagerConfig, RESOURCE_MANAGER_OPTIMUS};
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{ResolveError, Result};

const JOBS_PATH: &str = "/api/v1beta1/jobs";

/// Looks up jobs owned by another control plane.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Name of the control plane.
    fn name(&self) -> &str;

    /// Jobs matching a filter.
    async fn get_optimus_dependencies(&self, filter: &JobSpecFilter) -> Result<Vec<OptimusDependency>>;
}

/// HTTP client for another Optimus server.
#[derive(Clone)]
pub struct OptimusResourceManager {
    name: String,
    host: String,
    headers: BTreeMap<String, String>,
    client: Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetJobSpecificationsResponse {
    #[serde(default)]
    job_specification_responses: Vec<JobSpecificationResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSpecificationResponse {
    #[serde(default)]
    project_name: String,
    #[serde(default)]
    namespace_name: String,
    job: JobSpecification,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSpecification {
    name: String,
    #[serde(default)]
    task_name: String,
}

impl OptimusResourceManager {
    /// Create a client from configuration.
    pub fn new(config: &ResourceManagerConfig) -> Result<Self> {
        if config.manager_type != RESOURCE_MANAGER_OPTIMUS {
            return Err(ResolveError::UnknownResourceManager(config.manager_type.clone()));
        }
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            name: config.name.clone(),
            host: config.config.host.trim_end_matches('/').to_string(),
            headers: config.config.headers.clone(),
            client,
        })
    }

    fn query(filter: &JobSpecFilter) -> Vec<(&'static str, &str)> {
        let params = [
            ("job_name", filter.job_name.as_str()),
            ("project_name", filter.project_name.as_str()),
            ("resource_destination", filter.resource_destination.as_str()),
        ];
        params.into_iter().filter(|(_, v)| !v.is_empty()).collect()
    }
}

#[async_trait]
impl ResourceManager for OptimusResourceManager {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_optimus_dependencies(&self, filter: &JobSpecFilter) -> Result<Vec<OptimusDependency>> {
        let mut request = self
            .client
            .get(format!("{}{}", self.host, JOBS_PATH))
            .query(&Self::query(filter));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        debug!("querying resource manager {} with {:?}", self.name, filter);
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ResolveError::ResourceManager {
                name: self.name.clone(),
                status,
                body,
            });
        }

        let payload: GetJobSpecificationsResponse = response.json().await?;

        Ok(payload
            .job_specification_responses
            .into_iter()
            .map(|r| OptimusDependency {
                name: self.name.clone(),
                host: self.host.clone(),
                headers: self.headers.clone(),
                project_name: r.project_name,
                namespace_name: r.namespace_name,
                job_name: r.job.name,
                task_name: r.job.task_name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use optimus_core::ResourceManagerEndpoint;

    fn create_test_config(host: &str) -> ResourceManagerConfig {
        ResourceManagerConfig {
            name: "other-optimus".to_string(),
            manager_type: RESOURCE_MANAGER_OPTIMUS.to_string(),
            config: ResourceManagerEndpoint {
                host: host.to_string(),
                headers: BTreeMap::from([("key".to_string(), "value".to_string())]),
            },
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut config = create_test_config("http://localhost");
        config.manager_type = "datahub".to_string();
        let err = OptimusResourceManager::new(&config).err().unwrap();
        assert_eq!(err.to_string(), "resource manager [datahub] is not recognized");
    }

    #[tokio::test]
    async fn test_returns_dependencies_for_filter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", JOBS_PATH)
            .match_header("key", "value")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("job_name".into(), "job".into()),
                Matcher::UrlEncoded("project_name".into(), "project".into()),
                Matcher::UrlEncoded("resource_destination".into(), "resource".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "jobSpecificationResponses": [
                        {
                            "projectName": "project",
                            "namespaceName": "namespace",
                            "job": {"version": 0, "name": "job", "taskName": "bq2bq"}
                        }
                    ]
                }"#,
            )
            .create_async()
            .await;

        let manager = OptimusResourceManager::new(&create_test_config(&server.url())).unwrap();
        let filter = JobSpecFilter {
            project_name: "project".to_string(),
            job_name: "job".to_string(),
            resource_destination: "resource".to_string(),
        };
        let dependencies = manager.get_optimus_dependencies(&filter).await.unwrap();

        mock.assert_async().await;
        assert_eq!(
            dependencies,
            vec![OptimusDependency {
                name: "other-optimus".to_string(),
                host: server.url(),
                headers: BTreeMap::from([("key".to_string(), "value".to_string())]),
                project_name: "project".to_string(),
                namespace_name: "namespace".to_string(),
                job_name: "job".to_string(),
                task_name: "bq2bq".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_filter_fields_are_not_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", JOBS_PATH)
            .match_query(Matcher::Exact("resource_destination=bigquery%3A%2F%2Fp%3Ad.t".into()))
            .with_status(200)
            .with_body(r#"{"jobSpecificationResponses": []}"#)
            .create_async()
            .await;

        let manager = OptimusResourceManager::new(&create_test_config(&server.url())).unwrap();
        let filter = JobSpecFilter {
            resource_destination: "bigquery://p:d.t".to_string(),
            ..Default::default()
        };
        assert!(manager.get_optimus_dependencies(&filter).await.unwrap().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", JOBS_PATH)
            .with_status(404)
            .create_async()
            .await;

        let manager = OptimusResourceManager::new(&create_test_config(&server.url())).unwrap();
        let err = manager
            .get_optimus_dependencies(&JobSpecFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ResourceManager { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", JOBS_PATH)
            .with_status(200)
            .with_body("invalid-content")
            .create_async()
            .await;

        let manager = OptimusResourceManager::new(&create_test_config(&server.url())).unwrap();
        let err = manager
            .get_optimus_dependencies(&JobSpecFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Http(_)));
    }

    #[tokio::test]
    async fn test_invalid_host_is_an_error() {
        let manager = OptimusResourceManager::new(&create_test_config(":invalid-url")).unwrap();
        assert!(manager
            .get_optimus_dependencies(&JobSpecFilter::default())
            .await
            .is_err());
    }
}
