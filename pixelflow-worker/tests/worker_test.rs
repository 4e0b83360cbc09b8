use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat, Rgba, RgbaImage};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pixelflow_core::config::WebhookConfig;
use pixelflow_core::domain::{Job, JobStatus, PipelineStep, SourceType, Watermark};
use pixelflow_core::pipeline::{Output, Processor, RunResult};
use pixelflow_core::queue::{
    ProcessImagePayload, TaskDisposition, TaskEnvelope, TASK_TYPE_PROCESS_IMAGE,
};
use pixelflow_core::store::{JobStore, MemoryStore};
use pixelflow_core::webhook::{self, WebhookClient};
use pixelflow_worker::metrics::WorkerMetrics;
use pixelflow_worker::server::JobHandler;

fn webhook_config() -> WebhookConfig {
    WebhookConfig {
        signing_secret: "worker-test-secret".to_string(),
        timeout: Duration::from_secs(2),
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    }
}

fn handler(store: Arc<MemoryStore>, output_dir: &Path) -> JobHandler {
    JobHandler::new(
        store.clone(),
        store,
        WebhookClient::new(&webhook_config()),
        Processor::local(output_dir.to_path_buf()),
        // Object-store jobs are not exercised here; the slot still needs a
        // processor, and a local one rejects them at fetch time.
        Processor::local(output_dir.to_path_buf()),
        2,
        Arc::new(WorkerMetrics::new()),
    )
}

fn write_png(path: &Path, width: u32, height: u32) {
    let mut img = RgbaImage::new(width, height);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        *pixel = Rgba([(x % 251) as u8, (y % 241) as u8, 96, 255]);
    }
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
        .unwrap();
    std::fs::write(path, buf).unwrap();
}

async fn seed_job(store: &MemoryStore, id: &str, user_id: &str, object_key: &str) {
    let job = Job {
        id: id.to_string(),
        user_id: user_id.to_string(),
        status: JobStatus::Queued,
        source_type: SourceType::LocalFile,
        webhook_url: String::new(),
        pipeline: vec![],
        object_key: object_key.to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create(&job).await.unwrap();
}

fn envelope_for(payload: &ProcessImagePayload) -> TaskEnvelope {
    TaskEnvelope {
        task_id: "task-1".to_string(),
        task_type: TASK_TYPE_PROCESS_IMAGE.to_string(),
        retried: 0,
        max_retry: 5,
        timeout_secs: 180,
        enqueued_at: Utc::now(),
        payload: serde_json::to_value(payload).unwrap(),
    }
}

fn resize_step(id: &str, width: u32, format: &str, quality: i64) -> PipelineStep {
    PipelineStep {
        id: id.to_string(),
        action: "resize".to_string(),
        width,
        format: format.to_string(),
        quality,
        watermark: None,
    }
}

#[tokio::test]
async fn local_happy_path_writes_outputs_and_usage() {
    let input_dir = TempDir::new().unwrap();
    let output_dir = TempDir::new().unwrap();
    let input = input_dir.path().join("input.png");
    write_png(&input, 240, 120);
    let source_bytes = std::fs::read(&input).unwrap();

    let store = Arc::new(MemoryStore::new());
    seed_job(&store, "job-local-1", "alice", input.to_str().unwrap()).await;

    let payload = ProcessImagePayload {
        job_id: "job-local-1".to_string(),
        source_type: SourceType::LocalFile,
        webhook_url: String::new(),
        object_key: input.to_str().unwrap().to_string(),
        pipeline: vec![
            resize_step("thumb_small", 80, "jpeg", 75),
            PipelineStep {
                id: "watermarked".to_string(),
                action: "watermark".to_string(),
                width: 0,
                format: "png".to_string(),
                quality: 0,
                watermark: Some(Watermark {
                    text: "PixelFlow".to_string(),
                    opacity: 0.75,
                    gravity: "south".to_string(),
                }),
            },
        ],
        requested_at: Utc::now(),
    };

    let handler = handler(store.clone(), output_dir.path());
    let disposition = handler
        .handle(&CancellationToken::new(), &envelope_for(&payload))
        .await;
    assert!(matches!(disposition, TaskDisposition::Completed));

    let job_dir = output_dir.path().join("job-local-1");
    let thumb = std::fs::read(job_dir.join("thumb_small.jpeg")).unwrap();
    let watermarked = std::fs::read(job_dir.join("watermarked.png")).unwrap();

    assert_eq!(image::guess_format(&thumb).unwrap(), ImageFormat::Jpeg);
    let decoded = image::load_from_memory(&thumb).unwrap();
    assert_eq!(decoded.dimensions().0, 80);
    assert_ne!(watermarked, source_bytes);

    let job = store.get("job-local-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    let usage = store.usage_for("job-local-1").unwrap();
    assert_eq!(usage.user_id, "alice");
    assert_eq!(usage.pixels_processed, (80 * 40 + 240 * 120) as i64);
    assert!(usage.compute_time_ms >= 1);
}

#[tokio::test]
async fn missing_input_marks_failed_and_retries() {
    let output_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed_job(&store, "job-missing", "bob", "/nonexistent/input.png").await;

    let payload = ProcessImagePayload {
        job_id: "job-missing".to_string(),
        source_type: SourceType::LocalFile,
        webhook_url: String::new(),
        object_key: "/nonexistent/input.png".to_string(),
        pipeline: vec![resize_step("t", 10, "", 0)],
        requested_at: Utc::now(),
    };

    let handler = handler(store.clone(), output_dir.path());
    let disposition = handler
        .handle(&CancellationToken::new(), &envelope_for(&payload))
        .await;

    match disposition {
        TaskDisposition::Retry(reason) => assert!(reason.contains("run pipeline")),
        other => panic!("expected retry, got {other:?}"),
    }
    let job = store.get("job-missing").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(store.usage_for("job-missing").is_none());
}

#[tokio::test]
async fn unparseable_payload_is_discarded() {
    let output_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let handler = handler(store, output_dir.path());

    let envelope = TaskEnvelope {
        task_id: "task-bad".to_string(),
        task_type: TASK_TYPE_PROCESS_IMAGE.to_string(),
        retried: 0,
        max_retry: 5,
        timeout_secs: 180,
        enqueued_at: Utc::now(),
        payload: serde_json::json!({"job_id": 42}),
    };

    let disposition = handler.handle(&CancellationToken::new(), &envelope).await;
    match disposition {
        TaskDisposition::Discard(reason) => assert!(reason.contains("parse payload")),
        other => panic!("expected discard, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_task_type_is_discarded() {
    let output_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let handler = handler(store, output_dir.path());

    let envelope = TaskEnvelope {
        task_id: "task-odd".to_string(),
        task_type: "image:unknown".to_string(),
        retried: 0,
        max_retry: 5,
        timeout_secs: 180,
        enqueued_at: Utc::now(),
        payload: serde_json::json!({}),
    };

    let disposition = handler.handle(&CancellationToken::new(), &envelope).await;
    assert!(matches!(disposition, TaskDisposition::Discard(_)));
}

#[tokio::test]
async fn usage_clamps_bytes_saved_and_compute_time() {
    let output_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let handler = handler(store.clone(), output_dir.path());

    let result = RunResult {
        source_bytes: 100,
        outputs: vec![Output {
            step_id: "t".to_string(),
            action: "resize".to_string(),
            format: "png".to_string(),
            path: "t.png".to_string(),
            bytes: 200,
            width: 5,
            height: 5,
        }],
    };

    handler
        .record_usage("job-clamp", &result, Duration::ZERO)
        .await;

    let usage = store.usage_for("job-clamp").unwrap();
    assert_eq!(usage.pixels_processed, 25);
    assert_eq!(usage.bytes_saved, 0);
    assert!(usage.compute_time_ms >= 1);
    // Unknown job row falls back to the anonymous subject.
    assert_eq!(usage.user_id, "anonymous");
}

#[tokio::test]
async fn usage_reads_subject_from_job_row() {
    let output_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed_job(&store, "job-usage", "user-1", "input.png").await;
    let handler = handler(store.clone(), output_dir.path());

    let result = RunResult {
        source_bytes: 1_000,
        outputs: vec![
            Output {
                step_id: "a".to_string(),
                action: "resize".to_string(),
                format: "png".to_string(),
                path: "a.png".to_string(),
                bytes: 300,
                width: 10,
                height: 10,
            },
            Output {
                step_id: "b".to_string(),
                action: "resize".to_string(),
                format: "png".to_string(),
                path: "b.png".to_string(),
                bytes: 400,
                width: 20,
                height: 20,
            },
        ],
    };

    handler
        .record_usage("job-usage", &result, Duration::from_millis(250))
        .await;

    let usage = store.usage_for("job-usage").unwrap();
    assert_eq!(usage.user_id, "user-1");
    assert_eq!(usage.pixels_processed, 500);
    assert_eq!(usage.bytes_saved, 300);
    assert_eq!(usage.compute_time_ms, 250);
}

#[derive(Clone, Default)]
struct HookCapture {
    hits: Arc<AtomicU32>,
    last: Arc<Mutex<Option<(String, String, String, Vec<u8>)>>>,
}

async fn hook_receiver(
    State(state): State<HookCapture>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::http::StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    *state.last.lock().unwrap() = Some((
        header("X-Pixelflow-Event"),
        header("X-Pixelflow-Timestamp"),
        header("X-Pixelflow-Signature"),
        body.to_vec(),
    ));
    axum::http::StatusCode::OK
}

async fn spawn_hook(state: HookCapture) -> String {
    let app = Router::new()
        .route("/hook", post(hook_receiver))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/hook")
}

#[tokio::test]
async fn completed_webhook_is_signed_and_carries_outputs() {
    let input_dir = TempDir::new().unwrap();
    let output_dir = TempDir::new().unwrap();
    let input = input_dir.path().join("input.png");
    write_png(&input, 60, 30);

    let capture = HookCapture::default();
    let hook_url = spawn_hook(capture.clone()).await;

    let store = Arc::new(MemoryStore::new());
    seed_job(&store, "job-hook", "carol", input.to_str().unwrap()).await;

    let payload = ProcessImagePayload {
        job_id: "job-hook".to_string(),
        source_type: SourceType::LocalFile,
        webhook_url: hook_url,
        object_key: input.to_str().unwrap().to_string(),
        pipeline: vec![resize_step("t", 30, "png", 0)],
        requested_at: Utc::now(),
    };

    let handler = handler(store, output_dir.path());
    let disposition = handler
        .handle(&CancellationToken::new(), &envelope_for(&payload))
        .await;
    assert!(matches!(disposition, TaskDisposition::Completed));

    let (event, timestamp, signature, body) = capture.last.lock().unwrap().clone().unwrap();
    assert_eq!(event, "job.completed");
    assert!(!timestamp.is_empty());
    assert_eq!(
        signature,
        webhook::sign("worker-test-secret", &timestamp, &body)
    );

    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["job_id"], "job-hook");
    assert_eq!(parsed["status"], "succeeded");
    assert_eq!(parsed["outputs"].as_array().unwrap().len(), 1);
    assert_eq!(parsed["outputs"][0]["width"], 30);
}

#[tokio::test]
async fn failed_pipeline_sends_failure_webhook_and_retries() {
    let output_dir = TempDir::new().unwrap();
    let capture = HookCapture::default();
    let hook_url = spawn_hook(capture.clone()).await;

    let store = Arc::new(MemoryStore::new());
    seed_job(&store, "job-fail", "dave", "/nonexistent.png").await;

    let payload = ProcessImagePayload {
        job_id: "job-fail".to_string(),
        source_type: SourceType::LocalFile,
        webhook_url: hook_url,
        object_key: "/nonexistent.png".to_string(),
        pipeline: vec![resize_step("t", 10, "", 0)],
        requested_at: Utc::now(),
    };

    let handler = handler(store, output_dir.path());
    let disposition = handler
        .handle(&CancellationToken::new(), &envelope_for(&payload))
        .await;
    assert!(matches!(disposition, TaskDisposition::Retry(_)));

    let (event, _, _, body) = capture.last.lock().unwrap().clone().unwrap();
    assert_eq!(event, "job.failed");
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "failed");
    assert!(parsed["error"].as_str().unwrap().contains("fetch stage"));
}

#[tokio::test]
async fn resize_width_zero_is_a_pipeline_failure() {
    let input_dir = TempDir::new().unwrap();
    let output_dir = TempDir::new().unwrap();
    let input = input_dir.path().join("input.png");
    write_png(&input, 20, 20);

    let store = Arc::new(MemoryStore::new());
    seed_job(&store, "job-zero", "erin", input.to_str().unwrap()).await;

    let payload = ProcessImagePayload {
        job_id: "job-zero".to_string(),
        source_type: SourceType::LocalFile,
        webhook_url: String::new(),
        object_key: input.to_str().unwrap().to_string(),
        pipeline: vec![resize_step("t", 0, "", 0)],
        requested_at: Utc::now(),
    };

    let handler = handler(store.clone(), output_dir.path());
    let disposition = handler
        .handle(&CancellationToken::new(), &envelope_for(&payload))
        .await;
    assert!(matches!(disposition, TaskDisposition::Retry(_)));
    let job = store.get("job-zero").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}
