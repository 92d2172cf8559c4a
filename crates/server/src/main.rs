//! Goblet server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use goblet_core::HostCanonicalizer;
use goblet_core::config::AppConfig;
use goblet_repo::{ConfigTokenSource, Registry, TracingOperationLogger};
use goblet_server::{AppState, BackupTask, BearerTokenAuthorizer, LogErrorSink, create_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Goblet - a caching Git HTTP proxy
#[derive(Parser, Debug)]
#[command(name = "gobletd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "GOBLET_CONFIG",
        default_value = "config/goblet.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Goblet v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override
    // everything).
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("GOBLET_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    goblet_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let canonicalizer = Arc::new(HostCanonicalizer::new(config.upstream.allowed_hosts.clone()));
    let token_source = Arc::new(ConfigTokenSource::new(config.upstream.token.clone()));
    let registry = Arc::new(Registry::new(
        config.server.cache_root.clone(),
        canonicalizer,
        token_source,
        Arc::new(TracingOperationLogger),
    ));

    if let Some(backup) = &config.backup {
        let store = goblet_storage::from_config(&backup.storage)
            .await
            .context("failed to initialize backup storage")?;
        // Catch bucket misconfiguration now, not at the first snapshot.
        store
            .health_check()
            .await
            .context("backup storage health check failed")?;
        tracing::info!(backend = store.backend_name(), "Backup storage initialized");

        BackupTask::new(
            store,
            registry.clone(),
            backup.manifest_name.clone(),
            config.server.cache_root.clone(),
        )
        .spawn();
        tracing::info!("Backup task spawned");
    }

    let authorizer = Arc::new(BearerTokenAuthorizer::new(config.auth.token_hash.clone()));
    let state = AppState::new(config.clone(), registry, authorizer, Arc::new(LogErrorSink));
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
