//! Per-command protocol v2 state machine.
//!
//! Decides, per parsed command, whether to serve from the local mirror or
//! to go upstream, and produces the response stream. Fetch coalescing has
//! no dedicated data structure: the repository's writer lock means at most
//! one upstream fetch runs at a time, and every waiter re-probes
//! `has_all_wants` on a one-second tick, exiting as soon as its own wants
//! are durable locally even if the fetch is still running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use goblet_core::protocol::{Command, CommandKind, parse_fetch_wants, parse_ls_refs_response};
use goblet_core::{Code, Status, StatusResult};
use goblet_repo::ManagedRepository;

use crate::io::ResponseSink;
use crate::metrics;
use crate::reporting::ErrorSink;

/// How often a waiting fetch re-checks whether its wants arrived.
const CHECK_FREQUENCY: Duration = Duration::from_secs(1);

pub(crate) struct HandlerContext {
    pub error_sink: Arc<dyn ErrorSink>,
    pub fetch_timeout: Duration,
}

/// Handle one command, writing its output (or an error packet) to `out`.
/// Returns whether the next command in the same request should run.
pub(crate) async fn handle_command(
    cx: &HandlerContext,
    repo: &Arc<ManagedRepository>,
    command: &Command,
    out: &ResponseSink,
) -> bool {
    let started = Instant::now();
    let (cache_state, result) = match command.kind {
        CommandKind::LsRefs => (
            // Freshness of refs is what clients are entitled to, so
            // ls-refs always goes upstream.
            "queried-upstream",
            handle_ls_refs(cx, repo, command, out).await,
        ),
        CommandKind::Fetch => handle_fetch(repo, command, out).await,
    };

    let code = match &result {
        Ok(()) => Code::Ok,
        Err(status) => status.code,
    };
    metrics::record_inbound(command.kind.as_str(), cache_state, code, started);

    if let Err(status) = &result {
        out.send_error_packet(status).await;
        if status.is_server_error() {
            cx.error_sink.report(command.kind.as_str(), status);
        }
    }
    result.is_ok()
}

async fn handle_ls_refs(
    cx: &HandlerContext,
    repo: &Arc<ManagedRepository>,
    command: &Command,
    out: &ResponseSink,
) -> StatusResult<()> {
    let response = repo.ls_refs_upstream(command).await?;
    let refs = parse_ls_refs_response(&response)?;

    if repo.has_any_update(&refs).await? {
        // Fire-and-forget; the fetch outlives this request and its errors
        // are observable only through logs and metrics. The timeout keeps
        // a hung upstream from accumulating blocked fetch tasks behind the
        // writer lock.
        let repo = repo.clone();
        let timeout = cx.fetch_timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, repo.fetch_upstream())
                .await
                .is_err()
            {
                tracing::warn!(url = %repo.upstream_url(), "background upstream fetch timed out");
            }
        });
    }

    // The upstream response is forwarded verbatim, before any background
    // fetch could affect local state.
    out.send_response(&response).await
}

async fn handle_fetch(
    repo: &Arc<ManagedRepository>,
    command: &Command,
    out: &ResponseSink,
) -> (&'static str, StatusResult<()>) {
    let (oids, refnames) = match parse_fetch_wants(command) {
        Ok(wants) => wants,
        Err(status) => return ("locally-served", Err(status)),
    };

    let mut cache_state = "locally-served";
    match repo.has_all_wants(&oids, &refnames).await {
        Err(status) => return (cache_state, Err(status)),
        Ok(true) => {}
        Ok(false) => {
            cache_state = "queried-upstream";
            if let Err(status) = wait_for_wants(repo, &oids, &refnames, out).await {
                return (cache_state, Err(status));
            }
        }
    }

    let mut writer = out.writer();
    let result = repo.serve_fetch_local(command, &mut writer).await;
    (cache_state, result)
}

/// Wait until every want is locally resolvable.
///
/// Starts an upstream fetch and then races three things: the periodic
/// re-check (which lets this request proceed as soon as its wants land,
/// even mid-fetch), the fetch completing, and the client disconnecting.
/// A disconnect cancels only this wait; the fetch keeps running for other
/// waiters.
async fn wait_for_wants(
    repo: &Arc<ManagedRepository>,
    oids: &[String],
    refnames: &[String],
    out: &ResponseSink,
) -> StatusResult<()> {
    let wait_started = Instant::now();

    let mut fetch_task = tokio::spawn({
        let repo = repo.clone();
        async move { repo.fetch_upstream().await }
    });
    let mut ticks = tokio::time::interval_at(
        tokio::time::Instant::now() + CHECK_FREQUENCY,
        CHECK_FREQUENCY,
    );

    let result = loop {
        tokio::select! {
            _ = out.closed() => {
                break Err(Status::canceled(
                    "client disconnected while waiting for the upstream fetch",
                ));
            }
            join = &mut fetch_task => {
                let fetch_result = match join {
                    Ok(result) => result,
                    Err(e) => Err(Status::internal(format!("upstream fetch task failed: {e}"))),
                };
                match repo.has_all_wants(oids, refnames).await {
                    Err(status) => break Err(status),
                    Ok(true) => break Ok(()),
                    Ok(false) => {
                        break Err(match fetch_result {
                            Err(status) => status,
                            // The fetch reported success yet the wants are
                            // still unresolvable; treat it as a retryable
                            // upstream inconsistency.
                            Ok(()) => Status::unavailable(
                                "fetch completed but the requested objects are still missing",
                            ),
                        });
                    }
                }
            }
            _ = ticks.tick() => {
                match repo.has_all_wants(oids, refnames).await {
                    Err(status) => break Err(status),
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                }
            }
        }
    };

    metrics::UPSTREAM_FETCH_WAITING.observe(wait_started.elapsed().as_secs_f64());
    result
}
