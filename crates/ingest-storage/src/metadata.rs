use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use ingest_core::{CrawlJob, JobId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored job is not readable: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// One row per crawl job. Written at creation, rewritten on every state
/// change. Only status queries and resume read it back.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn record(&self, job: &CrawlJob) -> Result<(), MetadataError>;

    async fn get(&self, job_id: JobId) -> Result<Option<CrawlJob>, MetadataError>;

    /// Jobs left in a non-terminal state, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<CrawlJob>, MetadataError>;
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    rows: RwLock<HashMap<JobId, CrawlJob>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> MetadataError {
        MetadataError::Unavailable("memory metadata lock poisoned".into())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn record(&self, job: &CrawlJob) -> Result<(), MetadataError> {
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;
        rows.insert(job.job_id(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<CrawlJob>, MetadataError> {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(rows.get(&job_id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<CrawlJob>, MetadataError> {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        let mut unfinished: Vec<CrawlJob> = rows
            .values()
            .filter(|job| !job.state().is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|job| job.created_at());
        Ok(unfinished)
    }
}

/// Postgres-backed store. The full job is kept as JSONB next to the
/// columns status dashboards filter on.
#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, MetadataError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), MetadataError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("metadata migrations applied");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn record(&self, job: &CrawlJob) -> Result<(), MetadataError> {
        let document = serde_json::to_value(job)?;
        let failure = job.failure();
        sqlx::query(
            r#"
            INSERT INTO crawl_jobs (
                job_id, platform, state, remote_job_id, poll_count,
                created_at, updated_at, finished_at, result_location,
                record_count, error_stage, error_message, job
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (job_id) DO UPDATE
               SET state = EXCLUDED.state,
                   remote_job_id = EXCLUDED.remote_job_id,
                   poll_count = EXCLUDED.poll_count,
                   updated_at = EXCLUDED.updated_at,
                   finished_at = EXCLUDED.finished_at,
                   result_location = EXCLUDED.result_location,
                   record_count = EXCLUDED.record_count,
                   error_stage = EXCLUDED.error_stage,
                   error_message = EXCLUDED.error_message,
                   job = EXCLUDED.job
            "#,
        )
        .bind(job.job_id().as_uuid())
        .bind(job.platform().as_str())
        .bind(job.state().as_str())
        .bind(job.remote_job_id().map(|r| r.as_str().to_string()))
        .bind(i32::try_from(job.poll_count()).unwrap_or(i32::MAX))
        .bind(job.created_at())
        .bind(Utc::now())
        .bind(job.finished_at())
        .bind(job.result_location())
        .bind(job.record_count().map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
        .bind(failure.map(|f| f.stage.as_str()))
        .bind(failure.map(|f| f.message.as_str()))
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<CrawlJob>, MetadataError> {
        let row = sqlx::query("SELECT job FROM crawl_jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: serde_json::Value = row.try_get("job")?;
                Ok(Some(serde_json::from_value(document)?))
            }
            None => Ok(None),
        }
    }

    async fn list_unfinished(&self) -> Result<Vec<CrawlJob>, MetadataError> {
        let rows = sqlx::query(
            r#"
            SELECT job
              FROM crawl_jobs
             WHERE state NOT IN ('COMPLETED', 'FAILED', 'TIMEOUT')
             ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let document: serde_json::Value = row.try_get("job")?;
            out.push(serde_json::from_value(document)?);
        }
        Ok(out)
    }
}
