//! Goblet: a read-only caching proxy for the Git Smart HTTP v2 protocol.
//!
//! This crate provides the HTTP surface and the request-scoped protocol
//! state machine:
//! - Routing for `/info/refs`, `/git-upload-pack`, `/git-receive-pack`
//! - Client authorization and error reporting
//! - The per-command cache-or-upstream decision, including the
//!   fetch-coalescing wait loop
//! - The backup background task

pub mod auth;
pub mod backup;
pub mod handlers;
mod io;
pub mod metrics;
mod protocol;
pub mod reporting;
pub mod routes;
pub mod state;

pub use auth::{BearerTokenAuthorizer, RequestAuthorizer};
pub use backup::BackupTask;
pub use reporting::{ErrorSink, LogErrorSink};
pub use routes::create_router;
pub use state::AppState;
