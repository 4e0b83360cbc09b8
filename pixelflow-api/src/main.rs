use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pixelflow_api::{metrics::ApiMetrics, routes, state::AppState};
use pixelflow_core::config::Config;
use pixelflow_core::queue::RedisQueue;
use pixelflow_core::ratelimit::{RateLimiter, RedisTokenBucket};
use pixelflow_core::storage::{ObjectStore, S3ObjectStore};
use pixelflow_core::store::{JobStore, PostgresStore};
use pixelflow_core::telemetry;

/// External-dependency checks run against this deadline at startup; a miss
/// exits the process.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "pixelflow-api")]
#[command(about = "PixelFlow control plane: job admission and lifecycle over HTTP")]
struct Args {
    /// API bind address (overrides PIXELFLOW_API_ADDR)
    #[arg(long)]
    addr: Option<String>,

    /// Metrics bind address (overrides PIXELFLOW_API_METRICS_ADDR)
    #[arg(long)]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env();
    if let Some(addr) = args.addr {
        cfg.api.addr = addr;
    }
    if let Some(metrics_addr) = args.metrics_addr {
        cfg.api.metrics_addr = metrics_addr;
    }

    let telemetry_guard =
        telemetry::init("pixelflow-api", &cfg.telemetry).context("tracing init failed")?;

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

    let store = timeout(STARTUP_TIMEOUT, PostgresStore::connect(&cfg.database.dsn))
        .await
        .context("job store init timed out")?
        .context("job store init failed")?;

    let limiter: Option<Arc<dyn RateLimiter>> = if cfg.api.rate_limit_enabled {
        let bucket = RedisTokenBucket::connect(
            &cfg.queue.redis_url(),
            cfg.api.rate_limit_capacity,
            cfg.api.rate_limit_window,
        )
        .await
        .context("rate limiter init failed")?;
        timeout(STARTUP_TIMEOUT, bucket.ping())
            .await
            .context("rate limiter redis ping timed out")?
            .context("rate limiter redis ping failed")?;
        Some(Arc::new(bucket))
    } else {
        None
    };

    let metrics = Arc::new(ApiMetrics::new());
    let state = AppState::new(
        Arc::new(store) as Arc<dyn JobStore>,
        Arc::new(queue),
        Arc::new(storage) as Arc<dyn ObjectStore>,
        limiter,
        Arc::clone(&metrics),
        cfg.storage.presign_put_expiry,
        cfg.api.user_id_header.clone(),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let metrics_listener = TcpListener::bind(&cfg.api.metrics_addr)
        .await
        .with_context(|| format!("bind metrics address {}", cfg.api.metrics_addr))?;
    info!(addr = %cfg.api.metrics_addr, "metrics listening");
    let metrics_app = pixelflow_api::metrics::metrics_router(metrics);
    let metrics_shutdown = shutdown.clone();
    let metrics_server = tokio::spawn(async move {
        let result = axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await })
            .await;
        if let Err(err) = result {
            error!(error = %err, "metrics server failed");
        }
    });

    let listener = TcpListener::bind(&cfg.api.addr)
        .await
        .with_context(|| format!("bind api address {}", cfg.api.addr))?;
    info!(addr = %cfg.api.addr, "listening");

    let app = routes::router(state);
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .context("server failed")?;

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
