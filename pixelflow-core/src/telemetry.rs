//! Logging and distributed-tracing bootstrap, shared by both binaries.
//!
//! The subscriber always carries an `EnvFilter` + fmt layer; span export is
//! selected by `OTEL_TRACES_EXPORTER` (`none`, `stdout`, `otlp`).

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;
use crate::error::{PixelflowError, Result};

/// Keeps the tracer provider alive; call [`TelemetryGuard::shutdown`] on
/// process exit to flush batched spans.
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(&self) {
        if let Some(provider) = &self.provider {
            let _ = provider.shutdown();
        }
    }
}

pub fn init(service_name: &str, cfg: &TelemetryConfig) -> Result<TelemetryGuard> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let exporter = cfg.traces_exporter.trim().to_ascii_lowercase();
    let provider = match exporter.as_str() {
        "" | "none" => {
            registry
                .try_init()
                .map_err(|e| PixelflowError::Internal(format!("init subscriber: {e}")))?;
            info!("tracing exporter disabled");
            return Ok(TelemetryGuard { provider: None });
        }
        "stdout" => TracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .with_resource(service_resource(service_name))
            .build(),
        "otlp" => {
            let endpoint = cfg.otlp_endpoint.trim();
            if endpoint.is_empty() {
                return Err(PixelflowError::Internal(
                    "otlp trace exporter requires endpoint".to_string(),
                ));
            }
            let endpoint = if endpoint.contains("://") {
                endpoint.to_string()
            } else if cfg.otlp_insecure {
                format!("http://{endpoint}")
            } else {
                format!("https://{endpoint}")
            };

            let span_exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint)
                .build()
                .map_err(|e| PixelflowError::Internal(format!("create trace exporter: {e}")))?;
            TracerProvider::builder()
                .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
                .with_resource(service_resource(service_name))
                .build()
        }
        other => {
            return Err(PixelflowError::Internal(format!(
                "unsupported trace exporter: {other}"
            )));
        }
    };

    let tracer = provider.tracer(service_name.to_string());
    registry
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .map_err(|e| PixelflowError::Internal(format!("init subscriber: {e}")))?;

    global::set_tracer_provider(provider.clone());
    info!(exporter = %exporter, "tracing exporter enabled");

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}

fn service_resource(service_name: &str) -> Resource {
    Resource::new([KeyValue::new("service.name", service_name.to_string())])
}
