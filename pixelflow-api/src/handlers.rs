use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};

use pixelflow_core::domain::{CreateJobRequest, Job, JobStatus, SourceType, DEFAULT_USER_ID};
use pixelflow_core::id::new_job_id;
use pixelflow_core::queue::ProcessImagePayload;
use pixelflow_core::storage::source_object_key;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Request bodies are capped at 1 MiB; anything larger is a client error.
const MAX_BODY_BYTES: usize = 1 << 20;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request<Body>,
) -> AppResult<impl IntoResponse> {
    let req = decode_json::<CreateJobRequest>(request).await?;
    let source_type = req.validate().map_err(|e| AppError::bad_request(e.to_string()))?;

    let user_id = headers
        .get(state.user_id_header())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_USER_ID)
        .to_string();

    let now = Utc::now();
    let job_id = new_job_id();

    let mut object_key = req.object_key.trim().to_string();
    let mut presigned_put_url = String::new();
    let mut upload_state = "not_required";

    if source_type == SourceType::S3Presigned {
        object_key = source_object_key(&job_id);
        presigned_put_url = state
            .storage()
            .presigned_put_url(&object_key, state.presign_ttl())
            .await
            .map_err(|err| {
                error!(job_id = %job_id, error = %err, "generate presigned url failed");
                AppError::internal("failed to generate upload URL")
            })?;
        upload_state = "ready";
    }

    let job = Job {
        id: job_id,
        user_id,
        status: JobStatus::Created,
        source_type,
        webhook_url: req.webhook_url.clone(),
        pipeline: req.pipeline.clone(),
        object_key,
        created_at: now,
        updated_at: now,
    };

    state.store().create(&job).await.map_err(|err| {
        error!(job_id = %job.id, error = %err, "create job failed");
        AppError::internal("failed to create job")
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job.id,
            "status": job.status,
            "upload": {
                "object_key": job.object_key,
                "presigned_put_url": presigned_put_url,
                "presigned_url_state": upload_state,
            },
            "start_url": format!("/v1/jobs/{}/start", job.id),
        })),
    ))
}

pub async fn start_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job = state
        .store()
        .get(&job_id)
        .await
        .map_err(|err| {
            error!(job_id = %job_id, error = %err, "fetch job failed");
            AppError::internal("failed to load job")
        })?
        .ok_or_else(|| AppError::not_found("job not found"))?;

    verify_source_exists(&state, &job).await?;

    let payload = ProcessImagePayload {
        job_id: job.id.clone(),
        source_type: job.source_type,
        webhook_url: job.webhook_url.clone(),
        object_key: job.object_key.clone(),
        pipeline: job.pipeline.clone(),
        requested_at: Utc::now(),
    };

    // The enqueue is the commit point; the status row trails it.
    let task_info = state.queue().enqueue_process_image(payload).await.map_err(|err| {
        error!(job_id = %job.id, error = %err, "enqueue failed");
        AppError::internal("failed to enqueue job")
    })?;

    state
        .metrics()
        .jobs_enqueued
        .with_label_values(&[&task_info.queue])
        .inc();

    if let Err(err) = state.store().update_status(&job.id, JobStatus::Queued).await {
        warn!(job_id = %job.id, error = %err, "update status failed");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job.id,
            "status": JobStatus::Queued,
            "queue": task_info.queue,
            "task_id": task_info.task_id,
            "state": task_info.state,
            "enqueued_at": task_info.enqueued_at,
        })),
    ))
}

/// Source-existence gate: a job may only be enqueued once its input is
/// actually present.
async fn verify_source_exists(state: &AppState, job: &Job) -> AppResult<()> {
    match job.source_type {
        SourceType::LocalFile => match tokio::fs::metadata(&job.object_key).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(AppError::conflict(
                format!("source object is missing: {}", job.object_key),
            )),
            Err(err) => Err(AppError::conflict(format!(
                "source object check failed: {err}"
            ))),
        },
        SourceType::S3Presigned => match state.storage().object_exists(&job.object_key).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AppError::conflict(format!(
                "source object is missing: {}",
                job.object_key
            ))),
            Err(err) => Err(AppError::conflict(format!(
                "source object check failed: {err}"
            ))),
        },
    }
}

/// Strict JSON decoding: bounded body, unknown fields rejected by the
/// target type, trailing documents rejected by the parser.
async fn decode_json<T: serde::de::DeserializeOwned>(request: Request<Body>) -> AppResult<T> {
    let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::bad_request("invalid JSON body: request body too large"))?;

    serde_json::from_slice(&bytes)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))
}
