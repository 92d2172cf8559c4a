//! Prometheus metrics for outbound (proxy-to-upstream) commands.

use std::sync::LazyLock;
use std::time::Instant;

use goblet_core::Code;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

const LATENCY_BUCKETS: &[f64] = &[
    0.1, 0.2, 0.4, 0.8, 1.0, 2.0, 4.0, 8.0, 10.0, 20.0, 40.0, 80.0, 100.0, 200.0, 400.0, 800.0,
    1000.0,
];

pub static OUTBOUND_COMMANDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "goblet_outbound_commands_total",
            "Number of outbound commands",
        ),
        &["command", "status"],
    )
    .expect("metric creation failed")
});

pub static OUTBOUND_COMMAND_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "goblet_outbound_command_duration_seconds",
            "Processing time of outbound commands",
        )
        .buckets(LATENCY_BUCKETS.to_vec()),
        &["command", "status"],
    )
    .expect("metric creation failed")
});

/// Register this crate's metrics into `registry`.
pub fn register_metrics(registry: &Registry) {
    let _ = registry.register(Box::new(OUTBOUND_COMMANDS.clone()));
    let _ = registry.register(Box::new(OUTBOUND_COMMAND_DURATION.clone()));
}

pub(crate) fn record_outbound(command: &str, code: Code, started: Instant) {
    OUTBOUND_COMMANDS
        .with_label_values(&[command, code.as_str()])
        .inc();
    OUTBOUND_COMMAND_DURATION
        .with_label_values(&[command, code.as_str()])
        .observe(started.elapsed().as_secs_f64());
}
