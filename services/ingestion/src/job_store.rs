use crate::config::DatabaseConfig;
use crate::error::{IngestionError, Result};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Lifecycle of an ingestion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Uploading,
    Staged,
    AwaitingUpload,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Uploading => "uploading",
            JobStatus::Staged => "staged",
            JobStatus::AwaitingUpload => "awaiting_upload",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "downloading" => Ok(JobStatus::Downloading),
            "uploading" => Ok(JobStatus::Uploading),
            "staged" => Ok(JobStatus::Staged),
            "awaiting_upload" => Ok(JobStatus::AwaitingUpload),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(IngestionError::Corrupt(format!("unknown job status '{}'", other))),
        }
    }
}

/// Persisted ingestion job
#[derive(Debug, Clone, Serialize)]
pub struct IngestionJob {
    pub id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Source URL, or original filename for uploads
    pub source_url: String,
    pub status: JobStatus,
    pub s3_bucket: Option<String>,
    pub s3_key: Option<String>,
    pub size_bytes: Option<i64>,
    /// Lowercase hex SHA-256 of the stored bytes
    pub sha256: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final metadata recorded when a job completes
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub bucket: String,
    pub key: String,
    pub size_bytes: i64,
    pub sha256: Option<String>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, user_id: &str, source_url: &str, status: JobStatus)
        -> Result<IngestionJob>;

    async fn get(&self, id: Uuid) -> Result<Option<IngestionJob>>;

    /// Move a non-terminal job to `status`
    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()>;

    async fn complete(&self, id: Uuid, completion: &Completion) -> Result<()>;

    async fn fail(&self, id: Uuid, error: &str) -> Result<()>;

    /// Newest completed jobs for a user
    async fn recent_completed(&self, user_id: &str, limit: i64) -> Result<Vec<IngestionJob>>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    user_id: String,
    source_url: String,
    status: String,
    s3_bucket: Option<String>,
    s3_key: Option<String>,
    size_bytes: Option<i64>,
    sha256: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for IngestionJob {
    type Error = IngestionError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(IngestionJob {
            id: row.id,
            user_id: row.user_id,
            source_url: row.source_url,
            status: row.status.parse()?,
            s3_bucket: row.s3_bucket,
            s3_key: row.s3_key,
            size_bytes: row.size_bytes,
            sha256: row.sha256,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, user_id, source_url, status, s3_bucket, s3_key, \
                           size_bytes, sha256, error, created_at, updated_at";

/// Job store for ingestion records in PostgreSQL
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Create a new job store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self))]
    async fn create(
        &self,
        user_id: &str,
        source_url: &str,
        status: JobStatus,
    ) -> Result<IngestionJob> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO ingestion_jobs (id, user_id, source_url, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(source_url)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        let job = IngestionJob::try_from(row)?;
        debug!(job_id = %job.id, status = %job.status, "Ingestion job created");
        metrics::counter!("ingestion.jobs.created").increment(1);

        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<IngestionJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM ingestion_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IngestionJob::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestionError::Conflict(format!(
                "Job {} is missing or already finished",
                id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, completion))]
    async fn complete(&self, id: Uuid, completion: &Completion) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'completed', s3_bucket = $2, s3_key = $3,
                size_bytes = $4, sha256 = $5, error = NULL, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(&completion.bucket)
        .bind(&completion.key)
        .bind(completion.size_bytes)
        .bind(&completion.sha256)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestionError::Conflict(format!(
                "Job {} is missing or already finished",
                id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'failed', error = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_completed(&self, user_id: &str, limit: i64) -> Result<Vec<IngestionJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM ingestion_jobs
            WHERE user_id = $1 AND status = 'completed'
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IngestionJob::try_from).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process job store that also records every status a job passed through
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, IngestionJob>>,
    transitions: RwLock<HashMap<Uuid, Vec<JobStatus>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status the job has held, oldest first
    pub fn transitions(&self, id: Uuid) -> Vec<JobStatus> {
        self.transitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn update<F>(&self, id: Uuid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut IngestionJob),
    {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(&id)
            .filter(|job| !job.status.is_terminal())
            .ok_or_else(|| {
                IngestionError::Conflict(format!("Job {} is missing or already finished", id))
            })?;

        apply(job);
        job.updated_at = Utc::now();

        self.transitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_default()
            .push(job.status);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        user_id: &str,
        source_url: &str,
        status: JobStatus,
    ) -> Result<IngestionJob> {
        let now = Utc::now();
        let job = IngestionJob {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            source_url: source_url.to_string(),
            status,
            s3_bucket: None,
            s3_key: None,
            size_bytes: None,
            sha256: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job.clone());
        self.transitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, vec![status]);

        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<IngestionJob>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        self.update(id, |job| job.status = status)
    }

    async fn complete(&self, id: Uuid, completion: &Completion) -> Result<()> {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            job.s3_bucket = Some(completion.bucket.clone());
            job.s3_key = Some(completion.key.clone());
            job.size_bytes = Some(completion.size_bytes);
            job.sha256 = completion.sha256.clone();
            job.error = None;
        })
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        match self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
        }) {
            Err(IngestionError::Conflict(_)) => Ok(()),
            other => other,
        }
    }

    async fn recent_completed(&self, user_id: &str, limit: i64) -> Result<Vec<IngestionJob>> {
        let mut jobs: Vec<IngestionJob> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|job| job.user_id == user_id && job.status == JobStatus::Completed)
            .cloned()
            .collect();

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
