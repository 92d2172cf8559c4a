//! Route configuration.

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;

/// Create the application router.
///
/// Git endpoints live under arbitrary repository paths, so they are
/// dispatched by suffix in the fallback handler rather than a route table.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new().route("/healthz", get(handlers::health_check));

    // SECURITY: when enabled, /metrics must be network-restricted to
    // authorized Prometheus scrapers at the infrastructure level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .fallback(handlers::proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
