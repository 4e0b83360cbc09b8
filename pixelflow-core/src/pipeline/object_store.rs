use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{PipelineStep, SourceType};
use crate::error::{PixelflowError, Result};
use crate::pipeline::{
    content_type_for_format, normalize_output_format, sanitize_path_token, Emitter, Fetcher,
    Output, Request,
};
use crate::storage::ObjectStore;

/// Fetches the job's source blob. Rejects `local_file` requests, which
/// belong to the filesystem variant.
pub struct ObjectStoreFetcher {
    storage: Arc<dyn ObjectStore>,
}

impl ObjectStoreFetcher {
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Fetcher for ObjectStoreFetcher {
    async fn fetch(&self, req: &Request) -> Result<Vec<u8>> {
        if req.source_type == SourceType::LocalFile {
            return Err(PixelflowError::UnsupportedSourceType(
                req.source_type.to_string(),
            ));
        }
        self.storage.read_object(&req.object_key).await
    }
}

/// Emits outputs to `{prefix}/{job}/{step}.{format}` in the blob store.
pub struct ObjectStoreEmitter {
    storage: Arc<dyn ObjectStore>,
    output_prefix: String,
}

impl ObjectStoreEmitter {
    pub fn new(storage: Arc<dyn ObjectStore>, output_prefix: &str) -> Self {
        let prefix = output_prefix.trim();
        Self {
            storage,
            output_prefix: if prefix.is_empty() {
                "outputs".to_string()
            } else {
                prefix.to_string()
            },
        }
    }
}

#[async_trait]
impl Emitter for ObjectStoreEmitter {
    async fn emit(
        &self,
        req: &Request,
        step: &PipelineStep,
        data: &[u8],
        format: &str,
        width: u32,
        height: u32,
    ) -> Result<Output> {
        if step.id.trim().is_empty() {
            return Err(PixelflowError::Pipeline(
                "pipeline step id is required".to_string(),
            ));
        }

        let format = normalize_output_format(format);
        let object_key = format!(
            "{}/{}/{}.{format}",
            self.output_prefix,
            sanitize_path_token(&req.job_id),
            sanitize_path_token(&step.id),
        );

        self.storage
            .write_object(&object_key, data, content_type_for_format(format))
            .await?;

        Ok(Output {
            step_id: step.id.clone(),
            action: step.action.clone(),
            format: format.to_string(),
            path: object_key,
            bytes: data.len(),
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Request;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStore {
        written: Mutex<Vec<(String, usize, String)>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn presigned_put_url(&self, _key: &str, _expiry: Duration) -> Result<String> {
            Ok(String::new())
        }

        async fn object_exists(&self, _key: &str) -> Result<bool> {
            Ok(true)
        }

        async fn read_object(&self, _key: &str) -> Result<Vec<u8>> {
            Ok(vec![1, 2, 3])
        }

        async fn write_object(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
            self.written.lock().unwrap().push((
                key.to_string(),
                data.len(),
                content_type.to_string(),
            ));
            Ok(())
        }
    }

    fn request(source_type: SourceType) -> Request {
        Request {
            job_id: "job1".to_string(),
            source_type,
            object_key: "uploads/job1/source".to_string(),
            pipeline: vec![],
        }
    }

    #[tokio::test]
    async fn fetcher_rejects_local_requests() {
        let fetcher = ObjectStoreFetcher::new(Arc::new(RecordingStore::default()));
        let err = fetcher
            .fetch(&request(SourceType::LocalFile))
            .await
            .unwrap_err();
        assert!(matches!(err, PixelflowError::UnsupportedSourceType(_)));
    }

    #[tokio::test]
    async fn emitter_writes_under_outputs_prefix_with_content_type() {
        let store = Arc::new(RecordingStore::default());
        let emitter = ObjectStoreEmitter::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "");
        let step = PipelineStep {
            id: "wm/1".to_string(),
            action: "watermark".to_string(),
            width: 0,
            format: String::new(),
            quality: 0,
            watermark: None,
        };

        let output = emitter
            .emit(&request(SourceType::S3Presigned), &step, b"abc", "webp", 4, 2)
            .await
            .unwrap();

        assert_eq!(output.path, "outputs/job1/wm_1.webp");
        let written = store.written.lock().unwrap();
        assert_eq!(written[0], ("outputs/job1/wm_1.webp".to_string(), 3, "image/webp".to_string()));
    }
}
