//! Job specifications and their dependencies.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::cron::CronSchedule;
use crate::error::{ModelError, Result};
use crate::id::JobId;
use crate::project::ProjectRef;
use crate::window::Window;
use crate::Time;

/// Separator between project and job in a static cross-project dependency.
pub const PROJECT_JOB_SEPARATOR: char = '/';

/// A declared job: what runs, when, and what it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier
    #[serde(default)]
    pub id: JobId,

    /// Job name, unique within a project
    pub name: String,

    /// Spec version
    #[serde(default)]
    pub version: u32,

    /// Owner contact
    #[serde(default)]
    pub owner: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Owning namespace name
    #[serde(default)]
    pub namespace: String,

    /// When the job runs
    pub schedule: JobSchedule,

    /// Run behaviour
    #[serde(default)]
    pub behavior: JobBehavior,

    /// Task plugin and its configuration
    pub task: JobTask,

    /// Asset files keyed by filename
    #[serde(default)]
    pub assets: BTreeMap<String, String>,

    /// Hooks, in execution order
    #[serde(default)]
    pub hooks: Vec<JobHook>,

    /// Upstream jobs keyed by dependency name
    #[serde(default)]
    pub dependencies: BTreeMap<String, JobDependency>,

    /// Upstream jobs owned by other control planes
    #[serde(default)]
    pub external_dependencies: ExternalDependency,

    /// Destination URN written by the task, filled during resolution
    #[serde(default)]
    pub resource_destination: String,
}

impl JobSpec {
    /// Create a job with a daily schedule and default window.
    pub fn new(name: impl Into<String>, task_plugin: impl Into<String>, start_date: NaiveDate) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            version: 1,
            owner: String::new(),
            description: String::new(),
            labels: BTreeMap::new(),
            namespace: String::new(),
            schedule: JobSchedule {
                start_date,
                end_date: None,
                interval: "@daily".to_string(),
            },
            behavior: JobBehavior::default(),
            task: JobTask {
                plugin: task_plugin.into(),
                config: BTreeMap::new(),
                window: Window::default(),
                priority: 0,
            },
            assets: BTreeMap::new(),
            hooks: Vec::new(),
            dependencies: BTreeMap::new(),
            external_dependencies: ExternalDependency::default(),
            resource_destination: String::new(),
        }
    }

    /// Set the owning namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the cron interval.
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.schedule.interval = interval.into();
        self
    }

    /// Set the task window.
    pub fn with_window(mut self, window: Window) -> Self {
        self.task.window = window;
        self
    }

    /// Declare an unresolved static dependency by name.
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), JobDependency::unresolved());
        self
    }

    /// Append a hook.
    pub fn with_hook(mut self, hook: JobHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// A reference to this job.
    pub fn to_ref(&self) -> JobRef {
        JobRef {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Parse the cron interval.
    pub fn cron_schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.schedule.interval)
    }

    /// Check schedule, window and hook ordering.
    pub fn validate(&self) -> Result<()> {
        if let Some(end) = self.schedule.end_date {
            if end < self.schedule.start_date {
                return Err(ModelError::InvalidSchedule {
                    job: self.name.clone(),
                    reason: format!(
                        "end date {end} is before start date {}",
                        self.schedule.start_date
                    ),
                });
            }
        }
        self.cron_schedule().map_err(|e| ModelError::InvalidSchedule {
            job: self.name.clone(),
            reason: e.to_string(),
        })?;
        self.task.window.validate()?;

        for (position, hook) in self.hooks.iter().enumerate() {
            for name in &hook.depends_on {
                let earlier = self.hooks[..position].iter().any(|h| &h.name == name);
                if !earlier {
                    return Err(ModelError::InvalidHook {
                        job: self.name.clone(),
                        hook: hook.name.clone(),
                        reason: format!("depends on {name} which does not run before it"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    /// First date the job exists
    pub start_date: NaiveDate,

    /// Last date the job runs
    #[serde(default)]
    pub end_date: Option<NaiveDate>,

    /// Cron interval
    pub interval: String,
}

impl JobSchedule {
    /// Start date as midnight UTC.
    pub fn start_time(&self) -> Time {
        self.start_date.and_time(NaiveTime::MIN).and_utc()
    }
}

/// How a job behaves when it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBehavior {
    /// Backfill missed runs
    #[serde(default)]
    pub catch_up: bool,

    /// Wait for the previous run to succeed
    #[serde(default)]
    pub depends_on_past: bool,

    /// Retry policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Notification rules
    #[serde(default)]
    pub notify: Vec<Notifier>,
}

/// Retry policy for failed runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts
    pub count: u32,

    /// Wait between attempts
    #[serde(with = "crate::duration::serde_go")]
    pub delay: std::time::Duration,

    /// Grow the delay exponentially
    #[serde(default)]
    pub exponential_backoff: bool,
}

/// Events a notifier can fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A run failed
    Failure,
    /// A run missed its SLA
    SlaMiss,
}

/// Notification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notifier {
    /// Triggering event
    pub on: NotifyEvent,

    /// Targets in `scheme://route` form
    pub channels: Vec<String>,

    /// Extra configuration
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// The task a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTask {
    /// Task plugin name
    pub plugin: String,

    /// Plugin configuration
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Input window
    #[serde(default)]
    pub window: Window,

    /// Priority weight, assigned during deployment
    #[serde(default)]
    pub priority: i64,
}

/// A hook running around the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHook {
    /// Hook plugin name
    pub name: String,

    /// Plugin configuration
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Names of hooks that must run first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Positions in `JobSpec::hooks` of the resolved `depends_on` entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_depends_on: Vec<usize>,
}

impl JobHook {
    /// Create a hook without configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BTreeMap::new(),
            depends_on: Vec::new(),
            resolved_depends_on: Vec::new(),
        }
    }

    /// Declare a dependency on another hook.
    pub fn depends_on(mut self, hook: impl Into<String>) -> Self {
        self.depends_on.push(hook.into());
        self
    }
}

/// How a dependency relates to the dependent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Same project
    Intra,
    /// Another project on this control plane
    Inter,
    /// A job managed by another control plane
    Extra,
    /// An HTTP sensor
    Http,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Intra => write!(f, "intra"),
            DependencyType::Inter => write!(f, "inter"),
            DependencyType::Extra => write!(f, "extra"),
            DependencyType::Http => write!(f, "http"),
        }
    }
}

/// Lightweight pointer to a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    /// Job id; nil for jobs managed by another control plane
    #[serde(default = "JobId::nil")]
    pub id: JobId,

    /// Job name
    pub name: String,
}

/// An upstream job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    /// Resolved upstream job
    #[serde(default)]
    pub job: Option<JobRef>,

    /// Project of the upstream job
    #[serde(default)]
    pub project: Option<ProjectRef>,

    /// Relationship
    #[serde(rename = "type", default = "default_dependency_type")]
    pub dependency_type: DependencyType,

    /// Sensor details for HTTP dependencies
    #[serde(default)]
    pub http: Option<HttpDependency>,
}

fn default_dependency_type() -> DependencyType {
    DependencyType::Intra
}

impl JobDependency {
    /// A static dependency awaiting resolution.
    pub fn unresolved() -> Self {
        Self {
            job: None,
            project: None,
            dependency_type: DependencyType::Intra,
            http: None,
        }
    }

    /// A resolved dependency on a job in some project.
    pub fn resolved(job: JobRef, project: ProjectRef, dependency_type: DependencyType) -> Self {
        Self {
            job: Some(job),
            project: Some(project),
            dependency_type,
            http: None,
        }
    }

    /// Whether the entry is still waiting for resolution.
    pub fn is_unresolved(&self) -> bool {
        self.job.is_none() && self.project.is_none() && self.http.is_none()
    }
}

/// An HTTP sensor dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpDependency {
    /// Sensor name
    pub name: String,

    /// Polled URL
    pub url: String,

    /// Request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Query parameters
    #[serde(default)]
    pub request_params: BTreeMap<String, String>,
}

/// Upstream jobs resolved through external resource managers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDependency {
    /// Jobs found on other control planes
    #[serde(default)]
    pub optimus_dependencies: Vec<OptimusDependency>,
}

impl ExternalDependency {
    /// Whether there is nothing external.
    pub fn is_empty(&self) -> bool {
        self.optimus_dependencies.is_empty()
    }

    /// Append another set of dependencies.
    pub fn merge(&mut self, other: ExternalDependency) {
        self.optimus_dependencies.extend(other.optimus_dependencies);
    }
}

/// A job found on another control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptimusDependency {
    /// Resource manager name
    pub name: String,
    /// Resource manager host
    pub host: String,
    /// Headers used to reach the host
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Upstream project
    pub project_name: String,
    /// Upstream namespace
    pub namespace_name: String,
    /// Upstream job
    pub job_name: String,
    /// Upstream task plugin
    #[serde(default)]
    pub task_name: String,
}

/// A static dependency that could not be resolved anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnknownDependency {
    /// Dependent job
    pub job_name: String,
    /// Declared upstream project
    pub dependency_project_name: String,
    /// Declared upstream job
    pub dependency_job_name: String,
}

/// Query for jobs on an external control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct JobSpecFilter {
    /// Project name
    pub project_name: String,
    /// Job name
    pub job_name: String,
    /// Destination URN
    pub resource_destination: String,
}

/// A persisted dependency edge between two jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdDependencyPair {
    /// Dependent job
    pub job_id: JobId,
    /// Project of the upstream job
    pub dependent_project: ProjectRef,
    /// Upstream job
    pub dependent_job_id: JobId,
    /// Relationship
    pub dependency_type: DependencyType,
}

/// Split a static `project/job` dependency name.
///
/// Returns `None` for names without a separator; returns an error for names
/// that do not have exactly two non-empty sections.
pub fn split_project_job_name(name: &str) -> Option<std::result::Result<(&str, &str), String>> {
    if !name.contains(PROJECT_JOB_SEPARATOR) {
        return None;
    }
    let sections: Vec<&str> = name.split(PROJECT_JOB_SEPARATOR).collect();
    match sections.as_slice() {
        [project, job] if !project.is_empty() && !job.is_empty() => Some(Ok((project, job))),
        _ => Some(Err(format!("{name} should be in the form project{PROJECT_JOB_SEPARATOR}job"))),
    }
}

/// Group jobs by namespace, keeping the order in which namespaces first appear.
pub fn group_by_namespace(jobs: Vec<JobSpec>) -> Vec<(String, Vec<JobSpec>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<JobSpec>> = HashMap::new();
    for job in jobs {
        if !groups.contains_key(&job.namespace) {
            order.push(job.namespace.clone());
        }
        groups.entry(job.namespace.clone()).or_default().push(job);
    }
    order
        .into_iter()
        .filter_map(|ns| groups.remove(&ns).map(|jobs| (ns, jobs)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_validate_accepts_well_formed_job() {
        let job = JobSpec::new("job-a", "bq2bq", date(2021, 1, 1))
            .with_interval("0 2 * * *")
            .with_hook(JobHook::new("transporter"))
            .with_hook(JobHook::new("predator").depends_on("transporter"));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_end_before_start() {
        let mut job = JobSpec::new("job-a", "bq2bq", date(2021, 1, 10));
        job.schedule.end_date = Some(date(2021, 1, 1));
        assert!(matches!(
            job.validate(),
            Err(ModelError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_forward_hook_dependency() {
        let job = JobSpec::new("job-a", "bq2bq", date(2021, 1, 1))
            .with_hook(JobHook::new("predator").depends_on("transporter"))
            .with_hook(JobHook::new("transporter"));
        assert!(matches!(job.validate(), Err(ModelError::InvalidHook { .. })));

        let job = JobSpec::new("job-a", "bq2bq", date(2021, 1, 1))
            .with_hook(JobHook::new("predator").depends_on("predator"));
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_split_project_job_name() {
        assert_eq!(split_project_job_name("job-a"), None);
        assert_eq!(
            split_project_job_name("proj/job-a"),
            Some(Ok(("proj", "job-a")))
        );
        assert!(matches!(split_project_job_name("a/b/c"), Some(Err(_))));
        assert!(matches!(split_project_job_name("/job"), Some(Err(_))));
    }

    #[test]
    fn test_group_by_namespace_keeps_first_seen_order() {
        let start = date(2021, 1, 1);
        let jobs = vec![
            JobSpec::new("a", "t", start).with_namespace("ns-2"),
            JobSpec::new("b", "t", start).with_namespace("ns-1"),
            JobSpec::new("c", "t", start).with_namespace("ns-2"),
        ];
        let groups = group_by_namespace(jobs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "ns-2");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].1[0].name, "b");
    }

    #[test]
    fn test_job_spec_from_yaml() {
        let yaml = r#"
name: job-a
namespace: team-a
schedule:
  start_date: 2020-08-05
  interval: "0 2 * * *"
behavior:
  retry:
    count: 3
    delay: 5m
  notify:
    - on: failure
      channels: ["slack://#alerts"]
task:
  plugin: bq2bq
  config:
    DATASET: playground
  window:
    version: 1
    size: 72h
    truncate_to: d
dependencies:
  job-b: {}
  other-project/job-c: {}
hooks:
  - name: transporter
"#;
        let job: JobSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(job.namespace, "team-a");
        assert_eq!(job.task.window.version(), 1);
        assert_eq!(
            job.behavior.retry.as_ref().unwrap().delay,
            std::time::Duration::from_secs(300)
        );
        assert!(job.dependencies["job-b"].is_unresolved());
        assert_eq!(job.dependencies.len(), 2);
        assert!(job.validate().is_ok());
    }
}
