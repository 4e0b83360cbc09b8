//! Domain types shared by the control plane and the worker.

mod job;
mod usage;

pub use job::{
    CreateJobRequest, Job, JobStatus, PipelineStep, SourceType, Watermark, DEFAULT_USER_ID,
};
pub use usage::UsageLog;
