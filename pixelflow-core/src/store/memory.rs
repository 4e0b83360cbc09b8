use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::{Job, JobStatus, UsageLog};
use crate::error::{PixelflowError, Result};
use crate::store::{JobStore, UsageStore};

/// In-memory store used by tests and local experiments.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
    usage: RwLock<HashMap<String, UsageLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage_for(&self, job_id: &str) -> Option<UsageLog> {
        self.usage.read().expect("usage lock").get(job_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: &Job) -> Result<()> {
        self.jobs
            .write()
            .expect("jobs lock")
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().expect("jobs lock").get(id).cloned())
    }

    async fn update_status(&self, id: &str, status: JobStatus) -> Result<Job> {
        let mut jobs = self.jobs.write().expect("jobs lock");
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| PixelflowError::JobNotFound(id.to_string()))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_usage(&self, usage: &UsageLog) -> Result<()> {
        self.usage
            .write()
            .expect("usage lock")
            .insert(usage.job_id.clone(), usage.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceType;

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            user_id: "anonymous".to_string(),
            status: JobStatus::Created,
            source_type: SourceType::LocalFile,
            webhook_url: String::new(),
            pipeline: vec![],
            object_key: "input.png".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn update_status_mutates_row() {
        let store = MemoryStore::new();
        store.create(&job("a")).await.unwrap();
        let updated = store.update_status("a", JobStatus::Queued).await.unwrap();
        assert_eq!(updated.status, JobStatus::Queued);
        assert_eq!(
            store.get("a").await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn update_status_unknown_job_errors() {
        let store = MemoryStore::new();
        let err = store.update_status("nope", JobStatus::Queued).await;
        assert!(matches!(err, Err(PixelflowError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn record_usage_overwrites_by_job_id() {
        let store = MemoryStore::new();
        let mut usage = UsageLog {
            job_id: "a".to_string(),
            user_id: "alice".to_string(),
            pixels_processed: 100,
            bytes_saved: 10,
            compute_time_ms: 5,
            created_at: Utc::now(),
        };
        store.record_usage(&usage).await.unwrap();
        usage.pixels_processed = 200;
        store.record_usage(&usage).await.unwrap();
        assert_eq!(store.usage_for("a").unwrap().pixels_processed, 200);
    }
}
