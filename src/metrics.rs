//! Prometheus metrics for the run manager, following the teacher's
//! `OnceLock`-registered-gauge/counter pattern and its raw-socket text
//! exporter (`/metrics` is the only route this crate serves, so a full HTTP
//! server is unwarranted machinery).

use std::sync::OnceLock;

use anyhow::{Context, Result};
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder};

pub static ITERATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();
pub static WAVES_TOTAL: OnceLock<CounterVec> = OnceLock::new();
pub static WAVE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
pub static CHILD_TIMEOUTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();
pub static MERGE_CONFLICTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();
pub static RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("metrics initialization failed: {e}")),
    }
}

fn init_metrics_internal() -> Result<()> {
    if ITERATIONS_TOTAL.get().is_some() {
        return Ok(());
    }

    let iterations_total = register_counter_vec!(
        "jeeves_core_iterations_total",
        "Total run-loop iterations executed",
        &["provider", "outcome"]
    )
    .context("failed to register ITERATIONS_TOTAL")?;

    let waves_total = register_counter_vec!(
        "jeeves_core_waves_total",
        "Total parallel waves executed, by ending reason",
        &["phase", "reason"]
    )
    .context("failed to register WAVES_TOTAL")?;

    let wave_duration = register_histogram_vec!(
        "jeeves_core_wave_duration_seconds",
        "Wave execution duration in seconds",
        &["phase"]
    )
    .context("failed to register WAVE_DURATION")?;

    let child_timeouts_total = register_counter_vec!(
        "jeeves_core_child_timeouts_total",
        "Total child process timeouts, by kind",
        &["kind"]
    )
    .context("failed to register CHILD_TIMEOUTS_TOTAL")?;

    let merge_conflicts_total = register_counter_vec!(
        "jeeves_core_merge_conflicts_total",
        "Total worker-into-canonical merge conflicts",
        &["phase"]
    )
    .context("failed to register MERGE_CONFLICTS_TOTAL")?;

    let run_duration = register_histogram_vec!(
        "jeeves_core_run_duration_seconds",
        "Total wall-clock duration of a run, by completion reason",
        &["completion_reason"]
    )
    .context("failed to register RUN_DURATION")?;

    ITERATIONS_TOTAL
        .set(iterations_total)
        .map_err(|_| anyhow::anyhow!("failed to set ITERATIONS_TOTAL"))?;
    WAVES_TOTAL
        .set(waves_total)
        .map_err(|_| anyhow::anyhow!("failed to set WAVES_TOTAL"))?;
    WAVE_DURATION
        .set(wave_duration)
        .map_err(|_| anyhow::anyhow!("failed to set WAVE_DURATION"))?;
    CHILD_TIMEOUTS_TOTAL
        .set(child_timeouts_total)
        .map_err(|_| anyhow::anyhow!("failed to set CHILD_TIMEOUTS_TOTAL"))?;
    MERGE_CONFLICTS_TOTAL
        .set(merge_conflicts_total)
        .map_err(|_| anyhow::anyhow!("failed to set MERGE_CONFLICTS_TOTAL"))?;
    RUN_DURATION
        .set(run_duration)
        .map_err(|_| anyhow::anyhow!("failed to set RUN_DURATION"))?;

    Ok(())
}

pub fn record_iteration(provider: &str, outcome: &str) {
    if let Some(m) = ITERATIONS_TOTAL.get() {
        m.with_label_values(&[provider, outcome]).inc();
    }
}

pub fn record_wave(phase: &str, reason: &str, duration_secs: f64) {
    if let Some(m) = WAVES_TOTAL.get() {
        m.with_label_values(&[phase, reason]).inc();
    }
    if let Some(m) = WAVE_DURATION.get() {
        m.with_label_values(&[phase]).observe(duration_secs);
    }
}

pub fn record_child_timeout(kind: &str) {
    if let Some(m) = CHILD_TIMEOUTS_TOTAL.get() {
        m.with_label_values(&[kind]).inc();
    }
}

pub fn record_merge_conflict(phase: &str) {
    if let Some(m) = MERGE_CONFLICTS_TOTAL.get() {
        m.with_label_values(&[phase]).inc();
    }
}

pub fn record_run_duration(completion_reason: &str, duration_secs: f64) {
    if let Some(m) = RUN_DURATION.get() {
        m.with_label_values(&[completion_reason]).observe(duration_secs);
    }
}

/// Serve `/metrics` in Prometheus text format on `0.0.0.0:<port>`. A single
/// hand-rolled response is enough: this exporter has exactly one route and
/// no request body to parse.
pub async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    init_metrics().context("failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.context("failed to bind metrics server")?;

    tracing::info!("metrics server listening on http://0.0.0.0:{port}");

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                tokio::spawn(async move {
                    let body = get_metrics();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if let Err(e) = stream.write_all(response.as_bytes()).await {
                        tracing::warn!(error = %e, "metrics write error");
                    }
                    let _ = stream.shutdown().await;
                });
            }
            Err(e) => tracing::warn!(error = %e, "failed to accept metrics connection"),
        }
    }
}
