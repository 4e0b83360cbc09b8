//! Object storage client for job sources and pipeline outputs.
//!
//! Sources live at `uploads/{job_id}/source`, outputs under `outputs/`.
//! The service talks to any S3-compatible endpoint (MinIO in development)
//! with path-style addressing.

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, BucketConfiguration, Region};
use std::time::Duration;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{PixelflowError, Result};

/// Canonical source key for a presigned-upload job. Derived from the job id
/// and never changes.
pub fn source_object_key(job_id: &str) -> String {
    format!("uploads/{job_id}/source")
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn presigned_put_url(&self, object_key: &str, expiry: Duration) -> Result<String>;

    async fn object_exists(&self, object_key: &str) -> Result<bool>;

    async fn read_object(&self, object_key: &str) -> Result<Vec<u8>>;

    async fn write_object(&self, object_key: &str, data: &[u8], content_type: &str) -> Result<()>;
}

/// S3/MinIO-backed [`ObjectStore`].
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
    region: Region,
    credentials: Credentials,
    bucket_name: String,
}

impl S3ObjectStore {
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        if cfg.bucket.trim().is_empty() {
            return Err(PixelflowError::Storage("bucket is required".to_string()));
        }

        let scheme = if cfg.use_ssl { "https" } else { "http" };
        let region = Region::Custom {
            region: "us-east-1".to_string(),
            endpoint: format!("{scheme}://{}", cfg.endpoint),
        };
        let credentials = Credentials::new(
            Some(&cfg.access_key),
            Some(&cfg.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| PixelflowError::Storage(format!("build credentials: {e}")))?;

        let bucket = Bucket::new(&cfg.bucket, region.clone(), credentials.clone())
            .map_err(|e| PixelflowError::Storage(format!("create bucket handle: {e}")))?
            .with_path_style();

        Ok(Self {
            bucket,
            region,
            credentials,
            bucket_name: cfg.bucket.clone(),
        })
    }

    /// Create the bucket when it does not exist yet. Races with another
    /// replica doing the same are tolerated.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let exists = self
            .bucket
            .exists()
            .await
            .map_err(|e| PixelflowError::Storage(format!("check bucket existence: {e}")))?;
        if exists {
            return Ok(());
        }

        match Bucket::create_with_path_style(
            &self.bucket_name,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await
        {
            Ok(_) => {
                info!(bucket = %self.bucket_name, "created storage bucket");
                Ok(())
            }
            Err(err) => {
                // Another replica may have won the race.
                if self.bucket.exists().await.unwrap_or(false) {
                    return Ok(());
                }
                Err(PixelflowError::Storage(format!(
                    "create bucket {}: {err}",
                    self.bucket_name
                )))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn presigned_put_url(&self, object_key: &str, expiry: Duration) -> Result<String> {
        self.bucket
            .presign_put(object_key, expiry.as_secs() as u32, None, None)
            .await
            .map_err(|e| PixelflowError::Storage(format!("presign put object: {e}")))
    }

    async fn object_exists(&self, object_key: &str) -> Result<bool> {
        match self.bucket.head_object(object_key).await {
            Ok((_, code)) if code == 404 => Ok(false),
            Ok(_) => Ok(true),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(err) => Err(PixelflowError::Storage(format!(
                "stat object {object_key}: {err}"
            ))),
        }
    }

    async fn read_object(&self, object_key: &str) -> Result<Vec<u8>> {
        let response = self
            .bucket
            .get_object(object_key)
            .await
            .map_err(|e| PixelflowError::Storage(format!("get object {object_key}: {e}")))?;
        Ok(response.bytes().to_vec())
    }

    async fn write_object(&self, object_key: &str, data: &[u8], content_type: &str) -> Result<()> {
        self.bucket
            .put_object_with_content_type(object_key, data, content_type)
            .await
            .map_err(|e| PixelflowError::Storage(format!("put object {object_key}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_key_is_derived_from_job_id() {
        assert_eq!(source_object_key("abc123"), "uploads/abc123/source");
    }
}
