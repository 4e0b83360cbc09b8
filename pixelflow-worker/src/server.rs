use chrono::Utc;
use prometheus::IntGauge;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use pixelflow_core::domain::{JobStatus, SourceType, UsageLog, DEFAULT_USER_ID};
use pixelflow_core::pipeline::{Processor, Request, RunResult};
use pixelflow_core::queue::{
    ProcessImagePayload, RedisQueue, TaskDisposition, TaskEnvelope, TASK_TYPE_PROCESS_IMAGE,
};
use pixelflow_core::store::{JobStore, UsageStore};
use pixelflow_core::webhook::{WebhookClient, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED};

use crate::metrics::WorkerMetrics;

/// Decrements the active-jobs gauge when the handler releases its slot.
struct ActiveJobGuard<'a>(&'a IntGauge);

impl<'a> ActiveJobGuard<'a> {
    fn enter(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveJobGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Executes one `process_image` delivery end to end: status writes, the
/// pipeline itself, usage accounting and webhook dispatch.
///
/// Heavy work is gated by a counting semaphore so queue-pull parallelism can
/// exceed CPU-bound parallelism without oversubscribing the host.
pub struct JobHandler {
    store: Arc<dyn JobStore>,
    usage: Arc<dyn UsageStore>,
    webhook: WebhookClient,
    local: Processor,
    object: Processor,
    active_slots: Semaphore,
    metrics: Arc<WorkerMetrics>,
}

impl JobHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        usage: Arc<dyn UsageStore>,
        webhook: WebhookClient,
        local: Processor,
        object: Processor,
        max_active_jobs: usize,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            store,
            usage,
            webhook,
            local,
            object,
            active_slots: Semaphore::new(max_active_jobs.max(1)),
            metrics,
        }
    }

    /// Map one delivery to a queue disposition. Never panics the consumer
    /// loop; every failure mode folds into `Retry` or `Discard`.
    pub async fn handle(
        &self,
        cancel: &CancellationToken,
        envelope: &TaskEnvelope,
    ) -> TaskDisposition {
        let started = Instant::now();

        if envelope.task_type != TASK_TYPE_PROCESS_IMAGE {
            return TaskDisposition::Discard(format!("unknown task type: {}", envelope.task_type));
        }

        let payload: ProcessImagePayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => return TaskDisposition::Discard(format!("parse payload: {err}")),
        };

        let span = info_span!(
            "process_image",
            otel.kind = "consumer",
            job.id = %payload.job_id,
            job.source_type = %payload.source_type,
            job.pipeline_steps = payload.pipeline.len(),
        );

        // The per-delivery deadline cancels the pipeline and triggers
        // redelivery under the queue's retry policy.
        let job_cancel = cancel.child_token();
        let disposition = tokio::select! {
            disposition = self.process(&job_cancel, &payload, started).instrument(span) => disposition,
            _ = tokio::time::sleep(envelope.timeout()) => {
                job_cancel.cancel();
                TaskDisposition::Retry("processing deadline exceeded".to_string())
            }
        };

        let outcome = match &disposition {
            TaskDisposition::Completed => JobStatus::Succeeded,
            _ => JobStatus::Failed,
        };
        self.metrics
            .jobs_total
            .with_label_values(&[payload.source_type.as_str(), outcome.as_str()])
            .inc();
        self.metrics
            .job_duration
            .with_label_values(&[payload.source_type.as_str(), outcome.as_str()])
            .observe(started.elapsed().as_secs_f64());

        disposition
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        payload: &ProcessImagePayload,
        started: Instant,
    ) -> TaskDisposition {
        let _permit = match self.active_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return TaskDisposition::Retry("worker shutting down".to_string()),
        };
        let _active = ActiveJobGuard::enter(&self.metrics.active_jobs);

        info!(
            job_id = %payload.job_id,
            source_type = %payload.source_type,
            steps = payload.pipeline.len(),
            object_key = %payload.object_key,
            "processing job"
        );

        self.update_job_status(&payload.job_id, JobStatus::Processing)
            .await;

        let request = Request {
            job_id: payload.job_id.clone(),
            source_type: payload.source_type,
            object_key: payload.object_key.clone(),
            pipeline: payload.pipeline.clone(),
        };

        let processor = match payload.source_type {
            SourceType::LocalFile => &self.local,
            SourceType::S3Presigned => &self.object,
        };

        let result = match processor.run(cancel, &request).await {
            Ok(result) => result,
            Err(err) => {
                error!(job_id = %payload.job_id, error = %err, "pipeline failed");
                self.update_job_status(&payload.job_id, JobStatus::Failed)
                    .await;
                // Best-effort failure callback; the retriable error below is
                // what drives redelivery.
                if let Err(hook_err) = self
                    .dispatch_webhook(cancel, payload, EVENT_JOB_FAILED, &failed_body(payload, &err))
                    .await
                {
                    warn!(
                        job_id = %payload.job_id,
                        error = %hook_err,
                        "failure webhook delivery failed"
                    );
                }
                return TaskDisposition::Retry(format!("run pipeline: {err}"));
            }
        };

        info!(
            job_id = %payload.job_id,
            outputs = result.outputs.len(),
            "processed job"
        );
        self.update_job_status(&payload.job_id, JobStatus::Succeeded)
            .await;
        self.metrics
            .pipeline_outputs_total
            .inc_by(result.outputs.len() as u64);
        self.record_usage(&payload.job_id, &result, started.elapsed())
            .await;

        if let Err(err) = self
            .dispatch_webhook(
                cancel,
                payload,
                EVENT_JOB_COMPLETED,
                &completed_body(payload, &result),
            )
            .await
        {
            error!(job_id = %payload.job_id, error = %err, "webhook delivery failed");
            return TaskDisposition::Retry(format!("dispatch webhook: {err}"));
        }

        TaskDisposition::Completed
    }

    /// Status writes are best-effort: the queue, not the row, is the source
    /// of truth for in-flight work.
    async fn update_job_status(&self, job_id: &str, status: JobStatus) {
        if let Err(err) = self.store.update_status(job_id, status).await {
            warn!(job_id = %job_id, status = %status, error = %err, "job status update failed");
        }
    }

    async fn dispatch_webhook(
        &self,
        cancel: &CancellationToken,
        payload: &ProcessImagePayload,
        event: &str,
        body: &serde_json::Value,
    ) -> pixelflow_core::Result<()> {
        if payload.webhook_url.is_empty() {
            return Ok(());
        }
        self.webhook
            .send(cancel, &payload.webhook_url, event, body)
            .await
    }

    /// Usage accounting for a succeeded run. Upserts by job id; the subject
    /// is re-read from the job row rather than trusted from the payload.
    pub async fn record_usage(&self, job_id: &str, result: &RunResult, elapsed: Duration) {
        let user_id = match self.store.get(job_id).await {
            Ok(Some(job)) if !job.user_id.trim().is_empty() => job.user_id,
            Ok(_) => DEFAULT_USER_ID.to_string(),
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "usage lookup failed");
                DEFAULT_USER_ID.to_string()
            }
        };

        let mut pixels_processed: i64 = 0;
        let mut output_bytes: usize = 0;
        for output in &result.outputs {
            pixels_processed += i64::from(output.width) * i64::from(output.height);
            output_bytes += output.bytes;
        }

        let bytes_saved = result.source_bytes.saturating_sub(output_bytes) as i64;
        let compute_time_ms = ((elapsed.as_secs_f64() * 1000.0).ceil() as i64).max(1);

        let usage = UsageLog {
            job_id: job_id.to_string(),
            user_id,
            pixels_processed,
            bytes_saved,
            compute_time_ms,
            created_at: Utc::now(),
        };

        if let Err(err) = self.usage.record_usage(&usage).await {
            warn!(job_id = %job_id, error = %err, "usage log write failed");
            return;
        }

        self.metrics
            .pixels_processed_total
            .inc_by(pixels_processed.max(0) as u64);
        self.metrics
            .bytes_saved_total
            .inc_by(bytes_saved.max(0) as u64);
        self.metrics
            .compute_time_ms_total
            .inc_by(compute_time_ms.max(0) as u64);
    }
}

fn failed_body(payload: &ProcessImagePayload, err: &pixelflow_core::PixelflowError) -> serde_json::Value {
    json!({
        "job_id": payload.job_id,
        "status": JobStatus::Failed,
        "source_type": payload.source_type,
        "object_key": payload.object_key,
        "requested_at": payload.requested_at,
        "failed_at": Utc::now(),
        "error": err.to_string(),
    })
}

fn completed_body(payload: &ProcessImagePayload, result: &RunResult) -> serde_json::Value {
    json!({
        "job_id": payload.job_id,
        "status": JobStatus::Succeeded,
        "source_type": payload.source_type,
        "object_key": payload.object_key,
        "requested_at": payload.requested_at,
        "completed_at": Utc::now(),
        "outputs": result.outputs,
    })
}

/// Queue consumer pool: `concurrency` loops pull deliveries and hand them to
/// the shared [`JobHandler`].
pub struct WorkerServer {
    queue: RedisQueue,
    handler: Arc<JobHandler>,
    concurrency: usize,
}

impl WorkerServer {
    pub fn new(queue: RedisQueue, handler: Arc<JobHandler>, concurrency: usize) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let queue = self.queue.clone();
            let handler = Arc::clone(&self.handler);
            let cancel = cancel.clone();
            loops.spawn(async move {
                consume_loop(worker_id, queue, handler, cancel).await;
            });
        }
        info!(loops = self.concurrency, "worker consumer pool started");

        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "consumer loop aborted");
            }
        }
        info!("worker consumer pool drained");
    }
}

async fn consume_loop(
    worker_id: usize,
    queue: RedisQueue,
    handler: Arc<JobHandler>,
    cancel: CancellationToken,
) {
    info!(worker_id, "consumer loop started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match queue.dequeue(&cancel).await {
            Ok(Some(delivery)) => {
                let disposition = handler.handle(&cancel, &delivery.envelope).await;
                if let Err(err) = queue.settle(&delivery, disposition).await {
                    error!(worker_id, error = %err, "settling task failed");
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!(worker_id, error = %err, "queue receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    info!(worker_id, "consumer loop stopped");
}
