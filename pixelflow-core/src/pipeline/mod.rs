//! Per-job image pipeline: a Fetcher → Transformer → Emitter composition.
//!
//! The worker holds one processor per source variant and picks by the job's
//! source type. The source is fetched once; steps run sequentially and the
//! first failure aborts the run with no partial result recorded.

mod font;
mod local;
mod object_store;
mod transformer;

pub use local::{LocalFileEmitter, LocalFileFetcher};
pub use object_store::{ObjectStoreEmitter, ObjectStoreFetcher};
pub use transformer::{ImageTransformer, Transformed};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::{PipelineStep, SourceType};
use crate::error::{PixelflowError, Result};
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
pub struct Request {
    pub job_id: String,
    pub source_type: SourceType,
    pub object_key: String,
    pub pipeline: Vec<PipelineStep>,
}

/// One emitted artifact. Serialized into the `job.completed` webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    pub step_id: String,
    pub action: String,
    pub format: String,
    pub path: String,
    pub bytes: usize,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub outputs: Vec<Output>,
    /// Length of the fetched source, recorded for usage accounting.
    pub source_bytes: usize,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Read the source once per job. The returned buffer is shared across
    /// steps and must not be mutated.
    async fn fetch(&self, req: &Request) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(
        &self,
        req: &Request,
        step: &PipelineStep,
        data: &[u8],
        format: &str,
        width: u32,
        height: u32,
    ) -> Result<Output>;
}

/// CPU-bound transform stage. Deterministic for a given `(input, step)`.
pub trait Transformer: Send + Sync {
    fn transform(&self, input: &[u8], step: &PipelineStep) -> Result<Transformed>;
}

pub struct Processor {
    fetcher: Box<dyn Fetcher>,
    transformer: Arc<dyn Transformer>,
    emitter: Box<dyn Emitter>,
}

impl Processor {
    pub fn new(
        fetcher: Box<dyn Fetcher>,
        transformer: Arc<dyn Transformer>,
        emitter: Box<dyn Emitter>,
    ) -> Self {
        Self {
            fetcher,
            transformer,
            emitter,
        }
    }

    /// Local-filesystem variant: reads the source path and writes outputs
    /// under `output_dir`.
    pub fn local(output_dir: impl Into<std::path::PathBuf>) -> Self {
        Self::new(
            Box::new(LocalFileFetcher),
            Arc::new(ImageTransformer),
            Box::new(LocalFileEmitter::new(output_dir)),
        )
    }

    /// Object-store variant: fetches the source blob and emits outputs under
    /// the `outputs/` prefix.
    pub fn object_store(storage: Arc<dyn ObjectStore>) -> Self {
        Self::new(
            Box::new(ObjectStoreFetcher::new(Arc::clone(&storage))),
            Arc::new(ImageTransformer),
            Box::new(ObjectStoreEmitter::new(storage, "outputs")),
        )
    }

    pub async fn run(&self, cancel: &CancellationToken, req: &Request) -> Result<RunResult> {
        if req.job_id.trim().is_empty() {
            return Err(PixelflowError::Pipeline("job_id is required".to_string()));
        }
        if req.pipeline.is_empty() {
            return Err(PixelflowError::Pipeline(
                "pipeline must contain at least one step".to_string(),
            ));
        }

        let source = Bytes::from(
            self.fetcher
                .fetch(req)
                .await
                .map_err(|e| PixelflowError::Pipeline(format!("fetch stage: {e}")))?,
        );

        let mut outputs = Vec::with_capacity(req.pipeline.len());
        for step in &req.pipeline {
            if cancel.is_cancelled() {
                return Err(PixelflowError::Cancelled(format!(
                    "pipeline for job {}",
                    req.job_id
                )));
            }

            let transformed = {
                let transformer = Arc::clone(&self.transformer);
                let input = source.clone();
                let step_clone = step.clone();
                tokio::task::spawn_blocking(move || transformer.transform(&input, &step_clone))
                    .await
                    .map_err(|e| PixelflowError::Internal(format!("transform task: {e}")))?
                    .map_err(|e| {
                        PixelflowError::Pipeline(format!(
                            "transform stage step={} action={}: {e}",
                            step.id, step.action
                        ))
                    })?
            };

            let output = self
                .emitter
                .emit(
                    req,
                    step,
                    &transformed.data,
                    &transformed.format,
                    transformed.width,
                    transformed.height,
                )
                .await
                .map_err(|e| {
                    PixelflowError::Pipeline(format!(
                        "emit stage step={} action={}: {e}",
                        step.id, step.action
                    ))
                })?;
            outputs.push(output);
        }

        Ok(RunResult {
            outputs,
            source_bytes: source.len(),
        })
    }
}

/// Map any character outside `[A-Za-z0-9_-]` to `_`; empty becomes
/// `unknown`. Lossy on purpose, for filesystem and object-key safety.
pub fn sanitize_path_token(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn normalize_output_format(format: &str) -> &'static str {
    match format {
        "jpg" | "jpeg" => "jpeg",
        "png" => "png",
        "webp" => "webp",
        _ => "png",
    }
}

pub fn content_type_for_format(format: &str) -> &'static str {
    match normalize_output_format(format.trim().to_ascii_lowercase().as_str()) {
        "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}
