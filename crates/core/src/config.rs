//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Root directory of the on-disk repository mirrors.
    pub cache_root: PathBuf,
    /// Enable the /metrics endpoint for Prometheus scraping.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

/// Client authorization configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// SHA-256 hex of the accepted client bearer token.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
}

/// Source of the bearer token used for upstream requests.
///
/// Tokens are re-read immediately before every upstream call so that
/// short-lived credentials rotated on disk or in the environment are
/// picked up without a restart.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamTokenConfig {
    /// Token stored in a file.
    File {
        /// Path to the token file.
        path: PathBuf,
    },
    /// Token stored in an environment variable.
    Env {
        /// Environment variable name.
        var: String,
    },
    /// Token provided directly as a value (NOT recommended for production).
    Value {
        /// The bearer token.
        token: String,
    },
    /// No upstream credential; requests are sent unauthenticated.
    #[default]
    None,
}

/// Upstream configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Credential source for upstream fetches and ls-refs.
    #[serde(default)]
    pub token: UpstreamTokenConfig,
    /// Hosts the proxy will mirror. Empty means any host.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Upper bound on a background mirror fetch, in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_fetch_timeout_secs() -> u64 {
    3600
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            token: UpstreamTokenConfig::default(),
            allowed_hosts: Vec::new(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Object storage backend configuration for the backup subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// Force path-style URLs. Required for MinIO and some
        /// S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { .. } => Ok(()),
            StorageConfig::S3 { bucket, .. } => {
                if bucket.is_empty() {
                    Err("s3 config requires a non-empty bucket".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Backup subsystem configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Object store holding bundles and manifests.
    pub storage: StorageConfig,
    /// Name of this server's manifest series.
    pub manifest_name: String,
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,
    /// Client authorization configuration.
    pub auth: AuthConfig,
    /// Upstream configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Backup configuration (optional; no backups when absent).
    pub backup: Option<BackupConfig>,
}

impl AppConfig {
    /// Create a test configuration rooted at `cache_root`.
    ///
    /// **For testing only.** The token hash matches "test-client-token".
    pub fn for_testing(cache_root: PathBuf) -> Self {
        Self {
            server: ServerConfig {
                bind: default_bind(),
                cache_root,
                metrics_enabled: false,
            },
            auth: AuthConfig {
                // SHA-256 of "test-client-token"
                token_hash: "26ace80c6eac526b6537ddfe2f817e61dfc465cd73e206501186d374eb97ca21"
                    .to_string(),
            },
            upstream: UpstreamConfig::default(),
            backup: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_defaults() {
        let config = UpstreamConfig::default();
        assert!(matches!(config.token, UpstreamTokenConfig::None));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn storage_config_rejects_empty_bucket() {
        let config = StorageConfig::S3 {
            bucket: String::new(),
            endpoint: None,
            region: None,
            prefix: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_config_roundtrip() {
        let config = StorageConfig::S3 {
            bucket: "bundles".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: None,
            force_path_style: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: StorageConfig = serde_json::from_str(&json).unwrap();
        match decoded {
            StorageConfig::S3 {
                bucket,
                force_path_style,
                ..
            } => {
                assert_eq!(bucket, "bundles");
                assert!(force_path_style);
            }
            other => panic!("expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn app_config_defaults_optional_sections() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "server": { "cache_root": "/var/cache/goblet" },
            "auth": { "token_hash": "00" },
        }))
        .unwrap();
        assert!(config.backup.is_none());
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(config.server.metrics_enabled);
        assert!(config.upstream.allowed_hosts.is_empty());
    }
}
