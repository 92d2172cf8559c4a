//! HTTP endpoint handlers.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use goblet_core::protocol::capability_advertisement;
use goblet_core::{Status, StatusResult, parse_all_commands};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::io::{BodyItem, ResponseSink};
use crate::protocol::{HandlerContext, handle_command};
use crate::reporting;
use crate::state::AppState;

/// Upper bound on a request body. Requests are small compared to
/// responses (the entire request is read before any command runs, because
/// HTTP cannot interleave them), but a limit keeps a hostile client from
/// ballooning memory.
const MAX_REQUEST_BYTES: usize = 256 * 1024 * 1024;

/// Health check endpoint. Intentionally unauthenticated for load
/// balancers and probes.
pub async fn health_check() -> &'static str {
    "ok\n"
}

/// Fallback handler: Git endpoints are distinguished by URL suffix, not a
/// fixed route table, because the repository path precedes them.
pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    if let Err(status) = state.authorizer.authorize(req.headers()) {
        return reporting::http_error(&state, &status);
    }

    let protocol = req
        .headers()
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok());
    if protocol != Some("version=2") {
        return reporting::http_error(
            &state,
            &Status::invalid_argument("accepts only Git protocol v2"),
        );
    }

    let path = req.uri().path();
    if path.ends_with("/info/refs") {
        info_refs(&state, &req)
    } else if path.ends_with("/git-receive-pack") {
        reporting::http_error(
            &state,
            &Status::unimplemented("git-receive-pack not supported"),
        )
    } else if path.ends_with("/git-upload-pack") {
        upload_pack(state, req).await
    } else {
        reporting::http_error(&state, &Status::not_found("unknown endpoint"))
    }
}

/// `/info/refs`: the protocol v2 capability advertisement.
fn info_refs(state: &AppState, req: &Request) -> Response {
    let service = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("service=")));
    if service != Some("git-upload-pack") {
        return reporting::http_error(state, &Status::invalid_argument("accepts only git-fetch"));
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/x-git-upload-pack-advertisement",
        )],
        Body::from(capability_advertisement()),
    )
        .into_response()
}

/// `/git-upload-pack`: the fetch path.
async fn upload_pack(state: AppState, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let url = match request_url(&parts) {
        Ok(url) => url,
        Err(status) => return reporting::upload_pack_error(&state, &status),
    };

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return reporting::upload_pack_error(
                &state,
                &Status::invalid_argument(format!("cannot read the request body: {e}")),
            );
        }
    };

    let gzipped = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        == Some("gzip");
    let body = if gzipped {
        match gunzip(&body).await {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                return reporting::upload_pack_error(
                    &state,
                    &Status::invalid_argument(format!("cannot ungzip: {e}")),
                );
            }
        }
    } else {
        body
    };

    // The whole request is parsed up front; it may hold several commands
    // whose outputs are concatenated into the one response stream.
    let commands = match parse_all_commands(&body) {
        Ok(commands) => commands,
        Err(status) => return reporting::upload_pack_error(&state, &status),
    };

    let repo = match state.registry.open_or_create(&url).await {
        Ok(repo) => repo,
        Err(status) => return reporting::upload_pack_error(&state, &status),
    };

    let (tx, rx) = mpsc::channel::<BodyItem>(16);
    let cx = HandlerContext {
        error_sink: state.error_sink.clone(),
        fetch_timeout: state.fetch_timeout(),
    };
    tokio::spawn(async move {
        let sink = ResponseSink::new(tx);
        for command in &commands {
            if !handle_command(&cx, &repo, command, &sink).await {
                break;
            }
        }
    });

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/x-git-upload-pack-result",
        )],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Reconstruct the request URL. Git clients configured with this server as
/// an HTTP proxy send absolute-form URIs; plain reverse-proxy setups send
/// origin-form plus a Host header.
fn request_url(parts: &axum::http::request::Parts) -> StatusResult<Url> {
    let uri = &parts.uri;
    let text = if uri.scheme().is_some() && uri.host().is_some() {
        uri.to_string()
    } else {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::invalid_argument("request has no host"))?;
        format!("https://{host}{}", uri.path())
    };
    Url::parse(&text).map_err(|e| Status::invalid_argument(format!("cannot parse the URL: {e}")))
}

async fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await?;
    Ok(out)
}
