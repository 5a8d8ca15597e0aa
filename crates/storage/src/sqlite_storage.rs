//! SQLite storage backend.
//!
//! Persists projects, deployment requests and replays so that queued work
//! survives a restart. Rows keep the full entity as JSON next to the columns
//! the queries filter on.

use async_trait::async_trait;
use chrono::SecondsFormat;
use optimus_core::{
    DeploymentId, DeploymentStatus, JobDeployment, JobId, ProjectId, ProjectSpec, ReplayId,
    ReplayMessage, ReplaySpec, ReplayStatus, Time,
};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use super::trait_::{
    JobDeploymentRepository, ProjectRepository, ReplaySpecRepository, Result, StorageError,
};

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

// Fixed width so that text ordering matches time ordering.
fn timestamp(t: Time) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode<T: DeserializeOwned>(row: &SqliteRow) -> Result<T> {
    let data: String = row.try_get("data").map_err(db_err)?;
    Ok(serde_json::from_str(&data)?)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl SqliteStorage {
    /// Open (creating if missing) a database file.
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_path)
            .map_err(db_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Open a database from a path.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let path = path
            .to_str()
            .ok_or_else(|| StorageError::Other(format!("non UTF-8 path {}", path.display())))?;
        Self::new(path).await
    }

    /// Create an in-memory SQLite storage for testing.
    pub async fn in_memory() -> Result<Self> {
        // every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS projects (
                name TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS job_deployments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_job_deployments_status ON job_deployments(status, created_at)",
            "CREATE TABLE IF NOT EXISTS replays (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_replays_status ON replays(status)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        Ok(())
    }

    async fn fetch_deployment(&self, sql: &str, binds: &[String]) -> Result<Option<JobDeployment>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let row = query.fetch_optional(&self.pool).await.map_err(db_err)?;
        row.as_ref().map(decode).transpose()
    }

    async fn fetch_replays(&self, sql: &str, binds: &[String]) -> Result<Vec<ReplaySpec>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(decode).collect()
    }
}

#[async_trait]
impl ProjectRepository for SqliteStorage {
    async fn save(&self, project: &ProjectSpec) -> Result<()> {
        let data = serde_json::to_string(project)?;

        sqlx::query("INSERT OR REPLACE INTO projects (name, data) VALUES (?, ?)")
            .bind(&project.name)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> Result<ProjectSpec> {
        let row = sqlx::query("SELECT data FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => decode(&row),
            None => Err(StorageError::NotFound(format!("project {name}"))),
        }
    }

    async fn get_all(&self) -> Result<Vec<ProjectSpec>> {
        let rows = sqlx::query("SELECT data FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(decode).collect()
    }
}

#[async_trait]
impl JobDeploymentRepository for SqliteStorage {
    async fn save(&self, deployment: &JobDeployment) -> Result<()> {
        let data = serde_json::to_string(deployment)?;

        sqlx::query(
            "INSERT INTO job_deployments (id, project_id, status, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment.id.to_string())
        .bind(deployment.project.id.to_string())
        .bind(deployment.status.to_string())
        .bind(data)
        .bind(timestamp(deployment.created_at))
        .bind(timestamp(deployment.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StorageError::Conflict(format!("deployment {} exists", deployment.id))
            }
            other => db_err(other),
        })?;

        Ok(())
    }

    async fn save_if_not_queued(&self, deployment: &JobDeployment) -> Result<JobDeployment> {
        let data = serde_json::to_string(deployment)?;
        let queued = DeploymentStatus::InQueue.to_string();

        let inserted = sqlx::query(
            "INSERT INTO job_deployments (id, project_id, status, data, created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM job_deployments WHERE project_id = ? AND status = ?
            )",
        )
        .bind(deployment.id.to_string())
        .bind(deployment.project.id.to_string())
        .bind(deployment.status.to_string())
        .bind(data)
        .bind(timestamp(deployment.created_at))
        .bind(timestamp(deployment.updated_at))
        .bind(deployment.project.id.to_string())
        .bind(&queued)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        if inserted == 1 {
            return Ok(deployment.clone());
        }
        self.get_by_status_and_project_id(DeploymentStatus::InQueue, deployment.project.id)
            .await
    }

    async fn update_by_id(&self, deployment: &JobDeployment) -> Result<()> {
        let data = serde_json::to_string(deployment)?;

        let updated = sqlx::query(
            "UPDATE job_deployments SET status = ?, data = ?, updated_at = ? WHERE id = ?",
        )
        .bind(deployment.status.to_string())
        .bind(data)
        .bind(timestamp(deployment.updated_at))
        .bind(deployment.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        if updated == 0 {
            return Err(StorageError::NotFound(format!("deployment {}", deployment.id)));
        }
        Ok(())
    }

    async fn update_by_id_if(
        &self,
        deployment: &JobDeployment,
        from: DeploymentStatus,
        updated_at: Time,
    ) -> Result<bool> {
        let data = serde_json::to_string(deployment)?;

        let updated = sqlx::query(
            "UPDATE job_deployments SET status = ?, data = ?, updated_at = ?
            WHERE id = ? AND status = ? AND updated_at = ?",
        )
        .bind(deployment.status.to_string())
        .bind(data)
        .bind(timestamp(deployment.updated_at))
        .bind(deployment.id.to_string())
        .bind(from.to_string())
        .bind(timestamp(updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn update_status_if(
        &self,
        id: DeploymentId,
        from: DeploymentStatus,
        updated_at: Time,
        to: DeploymentStatus,
    ) -> Result<bool> {
        let now = timestamp(chrono::Utc::now().max(updated_at + chrono::Duration::microseconds(1)));

        let updated = sqlx::query(
            "UPDATE job_deployments
            SET status = ?, updated_at = ?,
                data = json_set(data, '$.status', ?, '$.updated_at', ?)
            WHERE id = ? AND status = ? AND updated_at = ?",
        )
        .bind(to.to_string())
        .bind(&now)
        .bind(to.to_string())
        .bind(&now)
        .bind(id.to_string())
        .bind(from.to_string())
        .bind(timestamp(updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn get_by_id(&self, id: DeploymentId) -> Result<JobDeployment> {
        self.fetch_deployment("SELECT data FROM job_deployments WHERE id = ?", &[id.to_string()])
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("deployment {id}")))
    }

    async fn get_by_status(&self, status: DeploymentStatus) -> Result<Vec<JobDeployment>> {
        let rows = sqlx::query("SELECT data FROM job_deployments WHERE status = ? ORDER BY created_at")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(decode).collect()
    }

    async fn get_by_status_and_project_id(
        &self,
        status: DeploymentStatus,
        project_id: ProjectId,
    ) -> Result<JobDeployment> {
        self.fetch_deployment(
            "SELECT data FROM job_deployments WHERE status = ? AND project_id = ? ORDER BY created_at LIMIT 1",
            &[status.to_string(), project_id.to_string()],
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("{status} deployment for project {project_id}")))
    }

    async fn get_first_executable_request(&self) -> Result<JobDeployment> {
        self.fetch_deployment(
            "SELECT data FROM job_deployments WHERE status = ? ORDER BY created_at LIMIT 1",
            &[DeploymentStatus::InQueue.to_string()],
        )
        .await?
        .ok_or_else(|| StorageError::NotFound("queued deployment".to_string()))
    }
}

#[async_trait]
impl ReplaySpecRepository for SqliteStorage {
    async fn insert(&self, replay: &ReplaySpec) -> Result<()> {
        let data = serde_json::to_string(replay)?;

        sqlx::query(
            "INSERT INTO replays (id, project_id, job_id, status, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(replay.id.to_string())
        .bind(replay.project.id.to_string())
        .bind(replay.job.id.to_string())
        .bind(replay.status.to_string())
        .bind(data)
        .bind(timestamp(replay.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StorageError::Conflict(format!("replay {} exists", replay.id))
            }
            other => db_err(other),
        })?;

        Ok(())
    }

    async fn update_status(&self, id: ReplayId, status: ReplayStatus, message: ReplayMessage) -> Result<()> {
        let mut replay = ReplaySpecRepository::get_by_id(self, id).await?;
        replay.status = status;
        replay.message = message;
        replay.updated_at = chrono::Utc::now();
        let data = serde_json::to_string(&replay)?;

        sqlx::query("UPDATE replays SET status = ?, data = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(data)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn get_by_id(&self, id: ReplayId) -> Result<ReplaySpec> {
        self.fetch_replays("SELECT data FROM replays WHERE id = ?", &[id.to_string()])
            .await?
            .pop()
            .ok_or_else(|| StorageError::NotFound(format!("replay {id}")))
    }

    async fn get_by_status(&self, statuses: &[ReplayStatus]) -> Result<Vec<ReplaySpec>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT data FROM replays WHERE status IN ({}) ORDER BY created_at",
            placeholders(statuses.len())
        );
        let binds: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        self.fetch_replays(&sql, &binds).await
    }

    async fn get_by_project_id_and_status(
        &self,
        project_id: ProjectId,
        statuses: &[ReplayStatus],
    ) -> Result<Vec<ReplaySpec>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT data FROM replays WHERE project_id = ? AND status IN ({}) ORDER BY created_at",
            placeholders(statuses.len())
        );
        let mut binds = vec![project_id.to_string()];
        binds.extend(statuses.iter().map(|s| s.to_string()));
        self.fetch_replays(&sql, &binds).await
    }

    async fn get_by_job_id_and_status(&self, job_id: JobId, statuses: &[ReplayStatus]) -> Result<Vec<ReplaySpec>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT data FROM replays WHERE job_id = ? AND status IN ({}) ORDER BY created_at",
            placeholders(statuses.len())
        );
        let mut binds = vec![job_id.to_string()];
        binds.extend(statuses.iter().map(|s| s.to_string()));
        self.fetch_replays(&sql, &binds).await
    }

    async fn get_by_project_id(&self, project_id: ProjectId) -> Result<Vec<ReplaySpec>> {
        self.fetch_replays(
            "SELECT data FROM replays WHERE project_id = ? ORDER BY created_at DESC",
            &[project_id.to_string()],
        )
        .await
    }
}
