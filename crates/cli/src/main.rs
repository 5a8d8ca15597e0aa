//! Optimus CLI - offline planning over a job spec file.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use optimus_core::{Config, JobSpec, ProjectSpec, ReplayRequest};
use optimus_progress::TracingObserver;
use optimus_replay::ReplayTreeBuilder;
use optimus_resolver::{DependencyResolver, ExternalDependencyResolver, PluginRegistry, PriorityResolver};
use optimus_storage::{JobSpecRepository, MemoryStore, ProjectRepository};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "optimus")]
#[command(about = "Plan priorities and replays for scheduled jobs", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve dependencies and print priority weights
    Priority {
        /// Spec file
        specs: PathBuf,
    },
    /// Print the jobs and runs a replay would clear
    ReplayPlan {
        /// Spec file
        specs: PathBuf,
        /// Root job
        #[arg(long)]
        job: String,
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: String,
        /// Replay the root job only
        #[arg(long)]
        ignore_downstream: bool,
        /// Namespaces whose downstream jobs may be replayed
        #[arg(long = "allowed-namespace")]
        allowed_namespaces: Vec<String>,
    },
    /// Print the input window of a job for a scheduled time
    Window {
        /// Spec file
        specs: PathBuf,
        /// Job name
        #[arg(long)]
        job: String,
        /// Scheduled time (RFC 3339)
        #[arg(long)]
        at: String,
    },
    /// Check schedules, windows, hooks and dependencies
    Validate {
        /// Spec file
        specs: PathBuf,
    },
}

/// A project and its jobs.
#[derive(Debug, Deserialize)]
struct SpecFile {
    project: ProjectSpec,
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

impl SpecFile {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn job(&self, name: &str) -> Result<&JobSpec> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .with_context(|| format!("job {} is not defined in project {}", name, self.project.name))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Priority { specs } => {
            let specs = SpecFile::load(&specs)?;
            let jobs = resolve(&config, &specs).await?;
            let mut jobs = PriorityResolver::new().resolve(jobs, Some(&TracingObserver))?;
            jobs.sort_by(|a, b| b.task.priority.cmp(&a.task.priority).then(a.name.cmp(&b.name)));

            println!("Priorities ({})", jobs.len());
            for job in jobs {
                println!("  {:>5} | {} | {}", job.task.priority, job.namespace, job.name);
            }
        }
        Commands::ReplayPlan {
            specs,
            job,
            start,
            end,
            ignore_downstream,
            allowed_namespaces,
        } => {
            let specs = SpecFile::load(&specs)?;
            let root = specs.job(&job)?.clone();
            let jobs = resolve(&config, &specs).await?;
            let job_specs: HashMap<String, JobSpec> = jobs.into_iter().map(|j| (j.name.clone(), j)).collect();

            let mut request = ReplayRequest::new(root, parse_day(&start)?, parse_day(&end)?, specs.project, job_specs)
                .with_ignore_downstream(ignore_downstream);
            if !allowed_namespaces.is_empty() {
                request = request.with_allowed_namespaces(allowed_namespaces);
            }
            let plan = ReplayTreeBuilder::new().plan(&request)?;

            let tree = &plan.execution_tree;
            println!("Replay plan for {} ({} jobs)", job, tree.len());
            for root in tree.root_ids() {
                for id in tree.topological_from(root) {
                    let node = tree.node(id);
                    let dependents: Vec<&str> = node.dependents.iter().map(|&c| tree.node(c).name.as_str()).collect();
                    println!("  {} -> [{}]", node.name, dependents.join(", "));
                    for run in &node.runs {
                        println!("      {}", run.to_rfc3339());
                    }
                }
            }
            if !plan.ignored_jobs.is_empty() {
                println!("Ignored: {}", plan.ignored_jobs.join(", "));
            }
        }
        Commands::Window { specs, job, at } => {
            let specs = SpecFile::load(&specs)?;
            let job = specs.job(&job)?;
            let at = DateTime::parse_from_rfc3339(&at)
                .with_context(|| format!("invalid time {at}"))?
                .with_timezone(&Utc);
            let range = job.task.window.get_time_range(at)?;

            println!("Window of {} (v{}) at {}", job.name, job.task.window.version(), at.to_rfc3339());
            println!("  start: {}", range.start.to_rfc3339());
            println!("  end:   {}", range.end.to_rfc3339());
            println!("  size:  {}h", range.size().num_hours());
        }
        Commands::Validate { specs } => {
            let specs = SpecFile::load(&specs)?;
            for job in &specs.jobs {
                job.validate().with_context(|| format!("job {} is invalid", job.name))?;
            }
            let jobs = resolve(&config, &specs).await?;
            PriorityResolver::new().resolve(jobs, Some(&TracingObserver))?;
            println!("{} jobs in project {} are valid", specs.jobs.len(), specs.project.name);
        }
    }

    Ok(())
}

/// Resolve the dependencies of every job in the file.
async fn resolve(config: &Config, specs: &SpecFile) -> Result<Vec<JobSpec>> {
    let store = Arc::new(MemoryStore::new());
    ProjectRepository::save(store.as_ref(), &specs.project).await?;
    for job in &specs.jobs {
        JobSpecRepository::save(store.as_ref(), &specs.project, job).await?;
    }

    let external = ExternalDependencyResolver::from_config(&config.resource_managers)?;
    let resolver = DependencyResolver::new(Arc::new(PluginRegistry::new()), store).with_external(external);
    let resolution = resolver
        .resolve(&specs.project, specs.jobs.clone(), Some(&TracingObserver))
        .await?;
    for unknown in &resolution.unknown_dependencies {
        info!(
            "job {} depends on unknown job {}/{}",
            unknown.job_name, unknown.dependency_project_name, unknown.dependency_job_name
        );
    }
    debug!("resolved {} jobs", resolution.jobs.len());
    Ok(resolution.jobs)
}

fn parse_day(raw: &str) -> Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid date {raw}"))?;
    Ok(day.and_time(NaiveTime::MIN).and_utc())
}
