use axum::body::Body;
use axum::http::Request;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::metrics::route_label;
use crate::middleware;
use crate::state::AppState;

/// Assemble the control-plane router. Outermost to innermost: request span,
/// metrics, rate limiting, handlers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/v1/jobs", post(handlers::create_job))
        .route("/v1/jobs/{id}/start", post(handlers::start_job))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(TimeoutLayer::new(Duration::from_secs(15)))
        .layer(from_fn_with_state(state.clone(), middleware::track_metrics))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "http_request",
                    otel.kind = "server",
                    http.method = %request.method(),
                    http.route = route_label(request.uri().path()),
                    http.target = %request.uri().path(),
                )
            }),
        )
        .with_state(state)
}
