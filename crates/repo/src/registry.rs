//! Process-wide registry of managed repositories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use goblet_core::canonical::{UrlCanonicalizer, cache_path};
use goblet_core::StatusResult;
use tokio::sync::Mutex;
use url::Url;

use crate::managed::ManagedRepository;
use crate::operation::OperationLogger;
use crate::token::TokenSource;

/// Registry keyed by local cache path.
///
/// Handles are process-wide so that every request for the same repository
/// shares the one gate that serializes upstream fetches; without a shared
/// handle, fetch coalescing is lost.
pub struct Registry {
    cache_root: PathBuf,
    canonicalizer: Arc<dyn UrlCanonicalizer>,
    token_source: Arc<dyn TokenSource>,
    operations: Arc<dyn OperationLogger>,
    http: reqwest::Client,
    repos: Mutex<HashMap<PathBuf, Arc<ManagedRepository>>>,
}

impl Registry {
    pub fn new(
        cache_root: PathBuf,
        canonicalizer: Arc<dyn UrlCanonicalizer>,
        token_source: Arc<dyn TokenSource>,
        operations: Arc<dyn OperationLogger>,
    ) -> Self {
        Self {
            cache_root,
            canonicalizer,
            token_source,
            operations,
            http: reqwest::Client::new(),
            repos: Mutex::new(HashMap::new()),
        }
    }

    /// Open the managed repository for a client URL, creating and
    /// initializing its mirror on first use.
    ///
    /// Concurrent callers with the same canonical URL observe the same
    /// handle; exactly one performs the on-disk initialization, and the
    /// others block on the handle's gate until it is done.
    pub async fn open_or_create(&self, url: &Url) -> StatusResult<Arc<ManagedRepository>> {
        let canonical = self.canonicalizer.canonicalize(url)?;
        let local_path = cache_path(&self.cache_root, &canonical);

        let repo = {
            let mut repos = self.repos.lock().await;
            repos
                .entry(local_path.clone())
                .or_insert_with(|| {
                    Arc::new(ManagedRepository::new(
                        local_path.clone(),
                        canonical,
                        self.token_source.clone(),
                        self.operations.clone(),
                        self.http.clone(),
                    ))
                })
                .clone()
        };

        repo.ensure_initialized().await?;
        Ok(repo)
    }

    /// Snapshot of all managed repositories, for the backup subsystem.
    /// Safe against concurrent insertion: iteration happens over the
    /// snapshot, not the live map.
    pub async fn list(&self) -> Vec<Arc<ManagedRepository>> {
        self.repos.lock().await.values().cloned().collect()
    }
}
