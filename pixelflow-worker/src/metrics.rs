use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Prometheus series owned by the worker process.
pub struct WorkerMetrics {
    registry: Registry,
    pub jobs_total: IntCounterVec,
    pub job_duration: HistogramVec,
    pub active_jobs: IntGauge,
    pub pipeline_outputs_total: IntCounter,
    pub pixels_processed_total: IntCounter,
    pub bytes_saved_total: IntCounter,
    pub compute_time_ms_total: IntCounter,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new(
                "pixelflow_worker_jobs_total",
                "Total worker jobs by source type and final status.",
            ),
            &["source_type", "status"],
        )
        .expect("jobs_total opts");

        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "pixelflow_worker_job_duration_seconds",
                "Total processing duration for each worker job.",
            ),
            &["source_type", "status"],
        )
        .expect("job_duration opts");

        let active_jobs = IntGauge::new(
            "pixelflow_worker_active_jobs",
            "Current number of active processing jobs in the worker.",
        )
        .expect("active_jobs opts");

        let pipeline_outputs_total = IntCounter::new(
            "pixelflow_worker_pipeline_outputs_total",
            "Total transformed outputs emitted by the worker.",
        )
        .expect("pipeline_outputs_total opts");

        let pixels_processed_total = IntCounter::new(
            "pixelflow_usage_pixels_processed_total",
            "Total pixels processed across all successful jobs.",
        )
        .expect("pixels_processed_total opts");

        let bytes_saved_total = IntCounter::new(
            "pixelflow_usage_bytes_saved_total",
            "Total bytes saved across all successful jobs.",
        )
        .expect("bytes_saved_total opts");

        let compute_time_ms_total = IntCounter::new(
            "pixelflow_usage_compute_time_ms_total",
            "Total compute time in milliseconds across successful jobs.",
        )
        .expect("compute_time_ms_total opts");

        for collector in [
            Box::new(jobs_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(job_duration.clone()),
            Box::new(active_jobs.clone()),
            Box::new(pipeline_outputs_total.clone()),
            Box::new(pixels_processed_total.clone()),
            Box::new(bytes_saved_total.clone()),
            Box::new(compute_time_ms_total.clone()),
        ] {
            registry.register(collector).expect("register worker metric");
        }

        Self {
            registry,
            jobs_total,
            job_duration,
            active_jobs,
            pipeline_outputs_total,
            pixels_processed_total,
            bytes_saved_total,
            compute_time_ms_total,
        }
    }

    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve_metrics(State(metrics): State<Arc<WorkerMetrics>>) -> String {
    metrics.encode()
}

pub fn metrics_router(metrics: Arc<WorkerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(metrics)
}
