use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PixelflowError, Result};

/// Subject recorded when no identity header accompanies a request.
pub const DEFAULT_USER_ID: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "created" => Ok(JobStatus::Created),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PixelflowError::Validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    LocalFile,
    S3Presigned,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::LocalFile => "local_file",
            SourceType::S3Presigned => "s3_presigned",
        }
    }

    /// Parse a caller-supplied source type, trimming whitespace and ignoring
    /// case.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local_file" => Ok(SourceType::LocalFile),
            "s3_presigned" => Ok(SourceType::S3Presigned),
            "" => Err(PixelflowError::Validation(
                "source_type is required".to_string(),
            )),
            _ => Err(PixelflowError::Validation(format!(
                "unsupported source_type: {value}"
            ))),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub text: String,
    #[serde(default)]
    pub opacity: f64,
    #[serde(default)]
    pub gravity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub width: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub quality: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<Watermark>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// The central durable entity. Rows are created by the API and mutated by
/// both tiers; they are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub source_type: SourceType,
    pub webhook_url: String,
    pub pipeline: Vec<PipelineStep>,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /v1/jobs`. Unknown fields are rejected at parse time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    pub source_type: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub object_key: String,
    #[serde(default)]
    pub pipeline: Vec<PipelineStep>,
}

impl CreateJobRequest {
    /// Admission validation. Defaults for quality, opacity and gravity are
    /// applied later by the transformer, not here.
    pub fn validate(&self) -> Result<SourceType> {
        let source_type = SourceType::parse(&self.source_type)?;
        if source_type == SourceType::LocalFile && self.object_key.trim().is_empty() {
            return Err(PixelflowError::Validation(
                "object_key is required for source_type=local_file".to_string(),
            ));
        }
        if self.pipeline.is_empty() {
            return Err(PixelflowError::Validation(
                "pipeline must contain at least one step".to_string(),
            ));
        }
        for (i, step) in self.pipeline.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(PixelflowError::Validation(format!(
                    "pipeline[{i}].id is required"
                )));
            }
            if step.action.trim().is_empty() {
                return Err(PixelflowError::Validation(format!(
                    "pipeline[{i}].action is required"
                )));
            }
        }
        Ok(source_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resize_step() -> PipelineStep {
        PipelineStep {
            id: "thumb".to_string(),
            action: "resize".to_string(),
            width: 100,
            format: String::new(),
            quality: 0,
            watermark: None,
        }
    }

    #[test]
    fn validate_accepts_s3_presigned_without_object_key() {
        let req = CreateJobRequest {
            source_type: "  S3_Presigned ".to_string(),
            webhook_url: String::new(),
            object_key: String::new(),
            pipeline: vec![resize_step()],
        };
        assert_eq!(req.validate().unwrap(), SourceType::S3Presigned);
    }

    #[test]
    fn validate_requires_object_key_for_local_file() {
        let req = CreateJobRequest {
            source_type: "local_file".to_string(),
            webhook_url: String::new(),
            object_key: "   ".to_string(),
            pipeline: vec![resize_step()],
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("object_key is required"));
    }

    #[test]
    fn validate_rejects_empty_pipeline() {
        let req = CreateJobRequest {
            source_type: "s3_presigned".to_string(),
            webhook_url: String::new(),
            object_key: String::new(),
            pipeline: vec![],
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn validate_reports_step_position() {
        let mut bad = resize_step();
        bad.id = String::new();
        let req = CreateJobRequest {
            source_type: "s3_presigned".to_string(),
            webhook_url: String::new(),
            object_key: String::new(),
            pipeline: vec![resize_step(), bad],
        };
        assert!(req
            .validate()
            .unwrap_err()
            .to_string()
            .contains("pipeline[1].id"));
    }

    #[test]
    fn validate_rejects_unknown_source_type() {
        let req = CreateJobRequest {
            source_type: "ftp".to_string(),
            webhook_url: String::new(),
            object_key: String::new(),
            pipeline: vec![resize_step()],
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn create_request_rejects_unknown_fields() {
        let err = serde_json::from_str::<CreateJobRequest>(
            r#"{"source_type":"s3_presigned","pipeline":[],"surprise":true}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("surprise"));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Created,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
