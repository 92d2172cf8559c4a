//! Long-running-operation logging.
//!
//! Mirror fetches and bundle reads/writes can run for minutes. They report
//! their lifecycle through these traits so deployments can route progress
//! to whatever log backend they use. The default implementation logs
//! through `tracing` with a per-operation correlation id.

use std::time::Instant;

use goblet_core::Status;
use url::Url;
use uuid::Uuid;

/// A single long-running operation in flight.
pub trait RunningOperation: Send + Sync {
    /// Report a progress line (typically a line of git output).
    fn progress(&self, message: &str);

    /// Report completion. `error` is `None` on success.
    fn done(&self, error: Option<&Status>);
}

/// Starts long-running operations.
pub trait OperationLogger: Send + Sync + 'static {
    fn start(&self, action: &str, url: &Url) -> Box<dyn RunningOperation>;
}

/// Logger that emits operation lifecycle events through `tracing`.
pub struct TracingOperationLogger;

impl OperationLogger for TracingOperationLogger {
    fn start(&self, action: &str, url: &Url) -> Box<dyn RunningOperation> {
        let op = TracingOperation {
            id: Uuid::new_v4(),
            action: action.to_string(),
            url: url.to_string(),
            started: Instant::now(),
        };
        tracing::info!(operation = %op.id, action = %op.action, url = %op.url, "operation started");
        Box::new(op)
    }
}

struct TracingOperation {
    id: Uuid,
    action: String,
    url: String,
    started: Instant,
}

impl RunningOperation for TracingOperation {
    fn progress(&self, message: &str) {
        tracing::info!(
            operation = %self.id,
            action = %self.action,
            url = %self.url,
            "{message}"
        );
    }

    fn done(&self, error: Option<&Status>) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        match error {
            None => tracing::info!(
                operation = %self.id,
                action = %self.action,
                url = %self.url,
                duration_ms,
                "operation finished"
            ),
            Some(err) => tracing::warn!(
                operation = %self.id,
                action = %self.action,
                url = %self.url,
                duration_ms,
                error = %err,
                "operation failed"
            ),
        }
    }
}

/// Operation sink that discards everything.
pub struct NoopOperation;

impl RunningOperation for NoopOperation {
    fn progress(&self, _message: &str) {}
    fn done(&self, _error: Option<&Status>) {}
}
