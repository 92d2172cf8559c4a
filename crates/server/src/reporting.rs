//! Error reporting.
//!
//! Every failed command or request is reported exactly once: metrics get
//! the canonical status, the client gets either an HTTP error or a
//! pkt-line error packet depending on the endpoint, and server-side
//! failures are additionally forwarded to the pluggable error sink.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use goblet_core::Status;
use goblet_core::pktline::Packet;

use crate::metrics;
use crate::state::AppState;

/// Command-type tag for request-level failures that never reached a
/// parsed command.
const NOT_A_COMMAND: &str = "not-a-command";

/// Sink for server-side errors. Transport to an external error tracker is
/// a deployment concern; the default logs through `tracing`.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, context: &str, status: &Status);
}

/// Error sink that logs through `tracing`.
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, context: &str, status: &Status) {
        tracing::error!(context, "Error while processing a request: {status}");
    }
}

fn forward_to_sink(state: &AppState, context: &str, status: &Status) {
    if status.is_server_error() {
        state.error_sink.report(context, status);
    }
}

/// Report a request-level failure and render it as an HTTP error.
///
/// An `Unauthenticated` response carries both challenge schemes so that
/// both token-holding automation and credential-helper setups can react.
pub(crate) fn http_error(state: &AppState, status: &Status) -> Response {
    metrics::record_inbound(NOT_A_COMMAND, "", status.code, Instant::now());
    forward_to_sink(state, NOT_A_COMMAND, status);

    let mut response = Response::builder()
        .status(StatusCode::from_u16(status.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    if status.code == goblet_core::Code::Unauthenticated {
        if let Some(headers) = response.headers_mut() {
            headers.append("WWW-Authenticate", HeaderValue::from_static("Bearer"));
            headers.append(
                "WWW-Authenticate",
                HeaderValue::from_static("Basic realm=goblet"),
            );
        }
    }
    response = response.header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
    response
        .body(Body::from(status.message.clone()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Report a request-level failure on `/git-upload-pack` and render it as a
/// pkt-line error packet. Git clients do not parse plain-text errors on
/// this endpoint.
pub(crate) fn upload_pack_error(state: &AppState, status: &Status) -> Response {
    metrics::record_inbound(NOT_A_COMMAND, "", status.code, Instant::now());
    forward_to_sink(state, NOT_A_COMMAND, status);

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/x-git-upload-pack-result",
        )
        .body(Body::from(Packet::error(&status.to_string()).encode()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
