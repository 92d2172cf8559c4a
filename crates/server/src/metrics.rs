//! Prometheus metrics for the Goblet server.
//!
//! Inbound metrics are tagged with the command type (`ls-refs`, `fetch`,
//! `not-a-command`), the canonical status, and whether the command was
//! served from the local mirror or had to query upstream.

use std::sync::LazyLock;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use goblet_core::Code;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[
    0.1, 0.2, 0.4, 0.8, 1.0, 2.0, 4.0, 8.0, 10.0, 20.0, 40.0, 80.0, 100.0, 200.0, 400.0, 800.0,
    1000.0,
];

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static INBOUND_COMMANDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("goblet_inbound_commands_total", "Number of inbound commands"),
        &["command", "status", "cache_state"],
    )
    .expect("metric creation failed")
});

pub static INBOUND_COMMAND_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "goblet_inbound_command_duration_seconds",
            "Processing time of inbound commands",
        )
        .buckets(LATENCY_BUCKETS.to_vec()),
        &["command", "status", "cache_state"],
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_FETCH_WAITING: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "goblet_upstream_fetch_waiting_seconds",
            "Duration that fetch requests waited for the upstream",
        )
        .buckets(LATENCY_BUCKETS.to_vec()),
    )
    .expect("metric creation failed")
});

/// Register all metrics, including the outbound ones owned by the
/// repository crate.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(INBOUND_COMMANDS.clone()));
    let _ = REGISTRY.register(Box::new(INBOUND_COMMAND_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(UPSTREAM_FETCH_WAITING.clone()));
    goblet_repo::metrics::register_metrics(&REGISTRY);
}

pub(crate) fn record_inbound(command: &str, cache_state: &str, code: Code, started: Instant) {
    INBOUND_COMMANDS
        .with_label_values(&[command, code.as_str(), cache_state])
        .inc();
    INBOUND_COMMAND_DURATION
        .with_label_values(&[command, code.as_str(), cache_state])
        .observe(started.elapsed().as_secs_f64());
}

/// `/metrics` endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    }
    (StatusCode::OK, buffer)
}
