//! Durable work queue carrying `process_image` tasks between the tiers.
//!
//! The control plane only enqueues; the worker consumes. Delivery is
//! at-least-once: retriable failures are re-scheduled with exponential
//! backoff up to `max_retry`, then dead-lettered.

mod redis;

pub use redis::{Delivery, RedisQueue};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{PipelineStep, SourceType};
use crate::error::Result;

pub const TASK_TYPE_PROCESS_IMAGE: &str = "image:process";

pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Per-delivery processing deadline.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(180);

/// Body of a `process_image` task. Round-trips structurally through JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessImagePayload {
    pub job_id: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub webhook_url: String,
    pub object_key: String,
    pub pipeline: Vec<PipelineStep>,
    pub requested_at: DateTime<Utc>,
}

/// Submission receipt surfaced by the `start_job` response.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub queue: String,
    pub state: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Wire envelope around a payload; carries the retry budget and deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub task_type: String,
    pub retried: u32,
    pub max_retry: u32,
    pub timeout_secs: u64,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TaskEnvelope {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Handler verdict, mapped onto queue operations by the consumer loop.
#[derive(Debug)]
pub enum TaskDisposition {
    Completed,
    /// Transient failure; re-deliver with backoff until the budget runs out.
    Retry(String),
    /// Poison message; goes straight to the dead-letter list.
    Discard(String),
}

#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue_process_image(&self, payload: ProcessImagePayload) -> Result<TaskInfo>;
}

/// Exponential retry delay: 5s, 10s, 20s, ... capped at 5 minutes.
pub(crate) fn retry_backoff(retried: u32) -> Duration {
    let base = Duration::from_secs(5);
    let cap = Duration::from_secs(300);
    let exp = base.saturating_mul(1u32 << retried.min(16));
    exp.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_round_trips_through_json() {
        let payload = ProcessImagePayload {
            job_id: "abc123".to_string(),
            source_type: SourceType::S3Presigned,
            webhook_url: "https://example.com/hook".to_string(),
            object_key: "uploads/abc123/source".to_string(),
            pipeline: vec![PipelineStep {
                id: "thumb".to_string(),
                action: "resize".to_string(),
                width: 120,
                format: "jpeg".to_string(),
                quality: 75,
                watermark: None,
            }],
            requested_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        };

        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: ProcessImagePayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn empty_webhook_url_is_omitted_from_wire() {
        let payload = ProcessImagePayload {
            job_id: "abc".to_string(),
            source_type: SourceType::LocalFile,
            webhook_url: String::new(),
            object_key: "input.png".to_string(),
            pipeline: vec![],
            requested_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(!encoded.contains("webhook_url"));
        let decoded: ProcessImagePayload = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.webhook_url.is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(5));
        assert_eq!(retry_backoff(1), Duration::from_secs(10));
        assert_eq!(retry_backoff(2), Duration::from_secs(20));
        assert_eq!(retry_backoff(10), Duration::from_secs(300));
    }
}
