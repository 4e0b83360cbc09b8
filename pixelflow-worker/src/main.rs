use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pixelflow_core::config::Config;
use pixelflow_core::pipeline::Processor;
use pixelflow_core::queue::RedisQueue;
use pixelflow_core::storage::{ObjectStore, S3ObjectStore};
use pixelflow_core::store::{JobStore, PostgresStore, UsageStore};
use pixelflow_core::telemetry;
use pixelflow_core::webhook::WebhookClient;
use pixelflow_worker::metrics::{metrics_router, WorkerMetrics};
use pixelflow_worker::server::{JobHandler, WorkerServer};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "pixelflow-worker")]
#[command(about = "PixelFlow data plane: queue consumer and image pipeline runner")]
struct Args {
    /// Consumer parallelism (overrides WORKER_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Metrics bind address (overrides WORKER_METRICS_ADDR)
    #[arg(long)]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env();
    if let Some(concurrency) = args.concurrency {
        cfg.worker.concurrency = concurrency;
    }
    if let Some(metrics_addr) = args.metrics_addr {
        cfg.worker.metrics_addr = metrics_addr;
    }

    let telemetry_guard =
        telemetry::init("pixelflow-worker", &cfg.telemetry).context("tracing init failed")?;

    info!(
        concurrency = cfg.worker.concurrency,
        max_active_jobs = cfg.worker.max_active_jobs,
        queue = %cfg.queue.name,
        redis = %cfg.queue.redis_addr,
        output_dir = %cfg.worker.local_output_dir,
        "starting worker"
    );

    let queue = RedisQueue::connect(&cfg.queue.redis_url(), &cfg.queue.name)
        .await
        .context("queue client init failed")?;
    timeout(STARTUP_TIMEOUT, queue.ping())
        .await
        .context("queue ping timed out")?
        .context("queue ping failed")?;

    let storage = S3ObjectStore::new(&cfg.storage).context("storage init failed")?;
    timeout(STARTUP_TIMEOUT, storage.ensure_bucket())
        .await
        .context("storage bucket check timed out")?
        .context("storage bucket check failed")?;
    let storage: Arc<dyn ObjectStore> = Arc::new(storage);

    let store = Arc::new(
        timeout(STARTUP_TIMEOUT, PostgresStore::connect(&cfg.database.dsn))
            .await
            .context("job store init timed out")?
            .context("job store init failed")?,
    );

    let metrics = Arc::new(WorkerMetrics::new());
    let handler = Arc::new(JobHandler::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        store as Arc<dyn UsageStore>,
        WebhookClient::new(&cfg.webhook),
        Processor::local(cfg.worker.local_output_dir.clone()),
        Processor::object_store(storage),
        cfg.worker.max_active_jobs,
        Arc::clone(&metrics),
    ));
    let server = WorkerServer::new(queue, handler, cfg.worker.concurrency);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let metrics_listener = TcpListener::bind(&cfg.worker.metrics_addr)
        .await
        .with_context(|| format!("bind metrics address {}", cfg.worker.metrics_addr))?;
    info!(addr = %cfg.worker.metrics_addr, "metrics listening");
    let metrics_app = metrics_router(metrics);
    let metrics_shutdown = shutdown.clone();
    let metrics_server = tokio::spawn(async move {
        let result = axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await })
            .await;
        if let Err(err) = result {
            error!(error = %err, "metrics server failed");
        }
    });

    server.run(shutdown.clone()).await;

    info!("shutting down");
    let _ = metrics_server.await;
    telemetry_guard.shutdown();
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        shutdown.cancel();
    });
}
