//! Telemetry: OpenTelemetry-backed tracing initialization, following the
//! teacher's OTLP layering but scoped to what this crate actually emits —
//! run/iteration/wave spans and structured log lines, no HTTP header
//! propagation (there is no inbound RPC surface here).

use std::env;
use std::time::Duration;

use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{trace, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{CoreError, CoreResult};

/// Initialize tracing for the process: OTLP export when `OTEL_ENABLED` is
/// unset or truthy, plain `fmt` output otherwise.
pub fn init_tracing() -> CoreResult<()> {
    let service_name = env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "jeeves-core".to_string());
    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4317".to_string());
    let enabled = env::var("OTEL_ENABLED")
        .unwrap_or_else(|_| "true".to_string())
        .parse::<bool>()
        .unwrap_or(true);

    if !enabled {
        return init_basic_tracing();
    }

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to create OTLP exporter: {e}")))?;

    let tracer_provider = trace::TracerProvider::builder()
        .with_resource(Resource::new(vec![
            opentelemetry::KeyValue::new(SERVICE_NAME, service_name.clone()),
            opentelemetry::KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]))
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("jeeves-core"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "jeeves_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    tracing::info!(service = service_name, endpoint = endpoint, "tracing initialized");
    Ok(())
}

fn init_basic_tracing() -> CoreResult<()> {
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "jeeves_core=info".into()));

    if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

/// Flush and shut down the global tracer provider. Call on clean process exit.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}

/// The current span's trace id, for correlating a run's log lines with its
/// exported trace, if any.
pub fn get_current_trace_id() -> Option<String> {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let current_span = tracing::Span::current();
    let context = current_span.context();
    let span_context = context.span().span_context().clone();

    if span_context.is_valid() {
        Some(format!("{:032x}", span_context.trace_id()))
    } else {
        None
    }
}
