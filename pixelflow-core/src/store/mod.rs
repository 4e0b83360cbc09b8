//! Durable job and usage persistence.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::domain::{Job, JobStatus, UsageLog};
use crate::error::Result;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Idempotent status write; returns the updated row or
    /// [`crate::PixelflowError::JobNotFound`].
    async fn update_status(&self, id: &str, status: JobStatus) -> Result<Job>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Upsert keyed by `job_id` so queue re-deliveries do not duplicate
    /// counts.
    async fn record_usage(&self, usage: &UsageLog) -> Result<()>;
}
