//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use goblet_core::config::AppConfig;
use goblet_repo::Registry;

use crate::auth::RequestAuthorizer;
use crate::reporting::ErrorSink;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Managed repository registry.
    pub registry: Arc<Registry>,
    /// Inbound request authorizer.
    pub authorizer: Arc<dyn RequestAuthorizer>,
    /// Server-side error sink.
    pub error_sink: Arc<dyn ErrorSink>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: Arc<Registry>,
        authorizer: Arc<dyn RequestAuthorizer>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            authorizer,
            error_sink,
        }
    }

    /// Upper bound applied to background fetches spawned by `ls-refs`.
    pub fn fetch_timeout(&self) -> Duration {
        self.config.upstream.fetch_timeout()
    }
}
