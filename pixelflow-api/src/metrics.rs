use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus series for the control plane, on a registry of their own so
/// the metrics bind exposes exactly what the API owns.
pub struct ApiMetrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration: HistogramVec,
    pub rate_limit_rejections: IntCounterVec,
    pub jobs_enqueued: IntCounterVec,
}

impl ApiMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "pixelflow_api_requests_total",
                "Total HTTP requests handled by the API.",
            ),
            &["method", "route", "status"],
        )
        .expect("requests_total opts");

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "pixelflow_api_request_duration_seconds",
                "API request latency in seconds.",
            ),
            &["method", "route", "status"],
        )
        .expect("request_duration opts");

        let rate_limit_rejections = IntCounterVec::new(
            Opts::new(
                "pixelflow_api_rate_limit_rejections_total",
                "Total API requests rejected by rate limiting.",
            ),
            &["route"],
        )
        .expect("rate_limit_rejections opts");

        let jobs_enqueued = IntCounterVec::new(
            Opts::new(
                "pixelflow_queue_jobs_enqueued_total",
                "Total jobs enqueued to the processing queue.",
            ),
            &["queue"],
        )
        .expect("jobs_enqueued opts");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("register requests_total");
        registry
            .register(Box::new(request_duration.clone()))
            .expect("register request_duration");
        registry
            .register(Box::new(rate_limit_rejections.clone()))
            .expect("register rate_limit_rejections");
        registry
            .register(Box::new(jobs_enqueued.clone()))
            .expect("register jobs_enqueued");

        Self {
            registry,
            requests_total,
            request_duration,
            rate_limit_rejections,
            jobs_enqueued,
        }
    }

    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buf)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse path parameters so metric and limiter labels stay low-cardinality.
pub fn route_label(path: &str) -> String {
    if path.starts_with("/v1/jobs/") && path.ends_with("/start") {
        "/v1/jobs/{id}/start".to_string()
    } else if path.starts_with("/v1/jobs") {
        "/v1/jobs".to_string()
    } else if path.starts_with("/healthz") {
        "/healthz".to_string()
    } else if path.starts_with("/metrics") {
        "/metrics".to_string()
    } else {
        path.to_string()
    }
}

async fn serve_metrics(State(metrics): State<Arc<ApiMetrics>>) -> String {
    metrics.encode()
}

/// Router for the dedicated metrics bind.
pub fn metrics_router(metrics: Arc<ApiMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(metrics)
}
