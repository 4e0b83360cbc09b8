use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

use crate::domain::{PipelineStep, SourceType};
use crate::error::{PixelflowError, Result};
use crate::pipeline::{
    normalize_output_format, sanitize_path_token, Emitter, Fetcher, Output, Request,
};

/// Reads the job's source from the local filesystem. Rejects any request
/// routed to the wrong variant.
pub struct LocalFileFetcher;

#[async_trait]
impl Fetcher for LocalFileFetcher {
    async fn fetch(&self, req: &Request) -> Result<Vec<u8>> {
        if req.source_type != SourceType::LocalFile {
            return Err(PixelflowError::UnsupportedSourceType(
                req.source_type.to_string(),
            ));
        }

        fs::read(&req.object_key).await.map_err(|e| {
            PixelflowError::Pipeline(format!("read input file {}: {e}", req.object_key))
        })
    }
}

/// Writes outputs under `{output_dir}/{job}/{step}.{format}` with sanitized
/// path tokens.
pub struct LocalFileEmitter {
    output_dir: PathBuf,
}

impl LocalFileEmitter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl Emitter for LocalFileEmitter {
    async fn emit(
        &self,
        req: &Request,
        step: &PipelineStep,
        data: &[u8],
        format: &str,
        width: u32,
        height: u32,
    ) -> Result<Output> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(PixelflowError::Pipeline(
                "output directory is required".to_string(),
            ));
        }
        if step.id.trim().is_empty() {
            return Err(PixelflowError::Pipeline(
                "pipeline step id is required".to_string(),
            ));
        }

        let format = normalize_output_format(format);
        let job_dir = self.output_dir.join(sanitize_path_token(&req.job_id));
        fs::create_dir_all(&job_dir)
            .await
            .map_err(|e| PixelflowError::Pipeline(format!("create output dir: {e}")))?;

        let filename = format!("{}.{format}", sanitize_path_token(&step.id));
        let full_path = job_dir.join(filename);
        fs::write(&full_path, data)
            .await
            .map_err(|e| PixelflowError::Pipeline(format!("write output file: {e}")))?;

        Ok(Output {
            step_id: step.id.clone(),
            action: step.action.clone(),
            format: format.to_string(),
            path: full_path.to_string_lossy().into_owned(),
            bytes: data.len(),
            width,
            height,
        })
    }
}
