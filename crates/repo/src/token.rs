//! Upstream credential source.

use async_trait::async_trait;
use goblet_core::config::UpstreamTokenConfig;
use goblet_core::{Status, StatusResult};

/// Supplies the bearer token for upstream requests.
///
/// Implementations are queried immediately before every upstream call;
/// caching a short-lived credential is the source's concern, not the
/// caller's.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// The current token, or `None` when upstream requests should be sent
    /// unauthenticated.
    async fn token(&self) -> StatusResult<Option<String>>;
}

/// Token source backed by the `upstream.token` configuration.
pub struct ConfigTokenSource {
    config: UpstreamTokenConfig,
}

impl ConfigTokenSource {
    pub fn new(config: UpstreamTokenConfig) -> Self {
        Self { config }
    }

    /// A fixed-token source, mainly for tests.
    pub fn value(token: impl Into<String>) -> Self {
        Self {
            config: UpstreamTokenConfig::Value {
                token: token.into(),
            },
        }
    }
}

#[async_trait]
impl TokenSource for ConfigTokenSource {
    async fn token(&self) -> StatusResult<Option<String>> {
        match &self.config {
            UpstreamTokenConfig::File { path } => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Status::internal(format!(
                        "cannot obtain an access token for the server: cannot read {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(token.trim().to_string()))
            }
            UpstreamTokenConfig::Env { var } => {
                let token = std::env::var(var).map_err(|_| {
                    Status::internal(format!(
                        "cannot obtain an access token for the server: {var} is not set"
                    ))
                })?;
                Ok(Some(token.trim().to_string()))
            }
            UpstreamTokenConfig::Value { token } => Ok(Some(token.clone())),
            UpstreamTokenConfig::None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn value_source_returns_token() {
        let source = ConfigTokenSource::value("secret");
        assert_eq!(source.token().await.unwrap(), Some("secret".to_string()));
    }

    #[tokio::test]
    async fn none_source_returns_none() {
        let source = ConfigTokenSource::new(UpstreamTokenConfig::None);
        assert_eq!(source.token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_source_trims_whitespace() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("token");
        tokio::fs::write(&path, "file-token\n").await.unwrap();

        let source = ConfigTokenSource::new(UpstreamTokenConfig::File { path });
        assert_eq!(source.token().await.unwrap(), Some("file-token".to_string()));
    }

    #[tokio::test]
    async fn missing_file_is_internal() {
        let source = ConfigTokenSource::new(UpstreamTokenConfig::File {
            path: "/does/not/exist".into(),
        });
        let err = source.token().await.unwrap_err();
        assert_eq!(err.code, goblet_core::Code::Internal);
    }
}
