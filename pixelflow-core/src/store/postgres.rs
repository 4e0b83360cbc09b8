use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use crate::domain::{Job, JobStatus, PipelineStep, SourceType, UsageLog};
use crate::error::{PixelflowError, Result};
use crate::store::{JobStore, UsageStore};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL DEFAULT 'anonymous',
        status TEXT NOT NULL,
        source_type TEXT NOT NULL,
        webhook_url TEXT NOT NULL DEFAULT '',
        pipeline JSONB NOT NULL,
        object_key TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "ALTER TABLE jobs ADD COLUMN IF NOT EXISTS user_id TEXT NOT NULL DEFAULT 'anonymous'",
    r#"
    CREATE TABLE IF NOT EXISTS usage_logs (
        job_id TEXT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        pixels_processed BIGINT NOT NULL,
        bytes_saved BIGINT NOT NULL,
        compute_time_ms BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS usage_logs_user_created_idx \
     ON usage_logs (user_id, created_at DESC)",
];

/// Postgres-backed job and usage store. The schema is applied idempotently
/// on startup.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(num_cpus::get() as u32)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("job store schema ensured");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn job_from_row(row: &PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let source_type: String = row.try_get("source_type")?;
        let pipeline: serde_json::Value = row.try_get("pipeline")?;
        let pipeline: Vec<PipelineStep> = serde_json::from_value(pipeline)?;

        Ok(Job {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: JobStatus::parse(&status)?,
            source_type: SourceType::parse(&source_type)?,
            webhook_url: row.try_get("webhook_url")?,
            pipeline,
            object_key: row.try_get("object_key")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let pipeline = serde_json::to_value(&job.pipeline)?;
        sqlx::query(
            "INSERT INTO jobs \
             (id, user_id, status, source_type, webhook_url, pipeline, object_key, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(job.status.as_str())
        .bind(job.source_type.as_str())
        .bind(&job.webhook_url)
        .bind(pipeline)
        .bind(&job.object_key)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, user_id, status, source_type, webhook_url, pipeline, object_key, \
             created_at, updated_at \
             FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: &str, status: JobStatus) -> Result<Job> {
        let row = sqlx::query(
            "UPDATE jobs SET status = $1, updated_at = $2 WHERE id = $3 \
             RETURNING id, user_id, status, source_type, webhook_url, pipeline, object_key, \
             created_at, updated_at",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::job_from_row(&row),
            None => Err(PixelflowError::JobNotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl UsageStore for PostgresStore {
    async fn record_usage(&self, usage: &UsageLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_logs \
             (job_id, user_id, pixels_processed, bytes_saved, compute_time_ms, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (job_id) DO UPDATE SET \
             user_id = EXCLUDED.user_id, \
             pixels_processed = EXCLUDED.pixels_processed, \
             bytes_saved = EXCLUDED.bytes_saved, \
             compute_time_ms = EXCLUDED.compute_time_ms, \
             created_at = EXCLUDED.created_at",
        )
        .bind(&usage.job_id)
        .bind(&usage.user_id)
        .bind(usage.pixels_processed)
        .bind(usage.bytes_saved)
        .bind(usage.compute_time_ms)
        .bind(usage.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
