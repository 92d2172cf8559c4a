//! Periodic snapshots of every managed repository into object storage,
//! and recovery from the latest snapshot at startup.
//!
//! Layout in the bucket: one bundle per repository at
//! `<host>/<path>/<seconds>`, and one manifest per snapshot cycle at
//! `goblet-repository-manifests/<manifestName>/<seconds>` listing the
//! upstream URLs backed up that cycle. Timestamps are decimal seconds
//! since the epoch, zero-padded to 12 digits so lexicographic order
//! agrees with numeric order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use goblet_core::canonical::object_prefix;
use goblet_core::{Status, StatusResult};
use goblet_repo::{ManagedRepository, Registry};
use goblet_storage::ObjectStore;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use url::Url;

const MANIFEST_DIR: &str = "goblet-repository-manifests";

/// Manifests older than this are garbage-collected each cycle.
const MANIFEST_RETENTION_SECS: i64 = 24 * 3600;

const BACKUP_FREQUENCY: Duration = Duration::from_secs(3600);

/// The background backup worker. One per process.
pub struct BackupTask {
    store: Arc<dyn ObjectStore>,
    registry: Arc<Registry>,
    manifest_name: String,
    cache_root: PathBuf,
}

impl BackupTask {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<Registry>,
        manifest_name: String,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            manifest_name,
            cache_root,
        }
    }

    /// Recover from the latest snapshots, then snapshot every hour.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.recover_from_backup().await;
            loop {
                tokio::time::sleep(BACKUP_FREQUENCY).await;
                self.save_backup().await;
            }
        })
    }

    fn manifest_prefix(&self) -> String {
        format!("{MANIFEST_DIR}/{}/", self.manifest_name)
    }

    /// Best-effort recovery: every failure is logged and skipped.
    pub async fn recover_from_backup(&self) {
        let repos = self.read_repo_list().await;
        if repos.is_empty() {
            tracing::info!("No repositories found from backup");
            return;
        }

        for raw_url in repos {
            let Ok(url) = Url::parse(&raw_url) else {
                tracing::warn!(url = %raw_url, "Cannot parse as a URL. Skipping");
                continue;
            };

            let bundle_path = match self.download_latest_bundle(&object_prefix(&url)).await {
                Ok(Some(path)) => path,
                Ok(None) => {
                    tracing::warn!(url = %raw_url, "Cannot find the backup bundle. Skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(url = %raw_url, error = %e, "Cannot download the backup bundle. Skipping");
                    continue;
                }
            };

            match self.registry.open_or_create(&url).await {
                Ok(repo) => {
                    if let Err(e) = repo.recover_from_bundle(&bundle_path).await {
                        tracing::warn!(url = %raw_url, error = %e, "Cannot recover from the bundle. Skipping");
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %raw_url, error = %e, "Cannot open a managed repository. Skipping");
                }
            }
            let _ = tokio::fs::remove_file(&bundle_path).await;
        }
    }

    /// Union of the upstream URLs named by every readable manifest.
    async fn read_repo_list(&self) -> Vec<String> {
        let keys = match self.store.list(&self.manifest_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Error while finding the manifests");
                return Vec::new();
            }
        };

        let mut repos = std::collections::BTreeSet::new();
        for key in keys.iter().filter(|k| timestamp_of(k).is_some()) {
            let data = match self.store.get(key).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cannot open a manifest file. Skipping");
                    continue;
                }
            };
            let Ok(text) = std::str::from_utf8(&data) else {
                tracing::warn!(key = %key, "Manifest file is not UTF-8. Skipping");
                continue;
            };
            for line in text.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    repos.insert(line.to_string());
                }
            }
        }
        repos.into_iter().collect()
    }

    /// Download the newest bundle under `prefix` to the scratch path.
    /// There is only one recoverer, serialized at startup, so the single
    /// scratch path cannot be used concurrently.
    async fn download_latest_bundle(&self, prefix: &str) -> StatusResult<Option<PathBuf>> {
        let Some((_, key)) = self.gc_bundles(prefix).await? else {
            return Ok(None);
        };

        let mut stream = self
            .store
            .get_stream(&key)
            .await
            .map_err(|e| Status::internal(format!("cannot read {key}: {e}")))?;

        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .map_err(|e| Status::internal(format!("cannot create the cache root: {e}")))?;
        let scratch = self.cache_root.join("tmp-bundle");
        let mut file = tokio::fs::File::create(&scratch)
            .await
            .map_err(|e| Status::internal(format!("cannot create {}: {e}", scratch.display())))?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Status::internal(format!("cannot read {key}: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Status::internal(format!("cannot write the bundle: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| Status::internal(format!("cannot write the bundle: {e}")))?;
        Ok(Some(scratch))
    }

    /// One snapshot cycle over every managed repository.
    pub async fn save_backup(&self) {
        let mut urls = Vec::new();
        for repo in self.registry.list().await {
            let url = repo.upstream_url().clone();
            let prefix = object_prefix(&url);

            let latest = match self.gc_bundles(&prefix).await {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "cannot GC bundles. Skipping");
                    continue;
                }
            };

            // Bundle timestamps have second precision.
            let latest_secs = latest.map(|(secs, _)| secs);
            let last_update_secs = repo.last_update_time().map(|t| t.unix_timestamp());
            if latest_secs.unwrap_or(i64::MIN) >= last_update_secs.unwrap_or(i64::MIN) {
                tracing::info!(url = %url, "existing bundle is up-to-date");
            } else if let Err(e) = self
                .upload_bundle(&repo, &prefix, last_update_secs.unwrap_or(0))
                .await
            {
                tracing::warn!(url = %url, error = %e, "cannot make a backup. Skipping");
                continue;
            }

            urls.push(url.to_string());
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let manifest_key = format!("{}{now:012}", self.manifest_prefix());
        let mut manifest = String::new();
        for url in &urls {
            manifest.push_str(url);
            manifest.push('\n');
        }
        if let Err(e) = self.store.put(&manifest_key, Bytes::from(manifest)).await {
            tracing::warn!(key = %manifest_key, error = %e, "cannot create the manifest");
            return;
        }

        self.gc_manifests(now).await;
    }

    /// Find the newest bundle under `prefix` and delete the rest.
    /// A key is a bundle iff its final path segment parses as an integer.
    async fn gc_bundles(&self, prefix: &str) -> StatusResult<Option<(i64, String)>> {
        let keys = self
            .store
            .list(&format!("{prefix}/"))
            .await
            .map_err(|e| Status::internal(format!("error while finding the bundles to GC: {e}")))?;

        let mut bundles: Vec<(i64, String)> = keys
            .into_iter()
            .filter_map(|key| timestamp_of(&key).map(|secs| (secs, key)))
            .collect();
        if bundles.is_empty() {
            return Ok(None);
        }
        bundles.sort();

        let latest = bundles.pop().unwrap_or_default();
        for (_, key) in bundles {
            if let Err(e) = self.store.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "cannot delete an old bundle");
            }
        }
        Ok(Some(latest))
    }

    /// Stream a fresh bundle of `repo` to `<prefix>/<secs>`.
    async fn upload_bundle(
        &self,
        repo: &Arc<ManagedRepository>,
        prefix: &str,
        secs: i64,
    ) -> StatusResult<()> {
        let key = format!("{prefix}/{secs:012}");
        let mut upload = self
            .store
            .put_stream(&key)
            .await
            .map_err(|e| Status::internal(format!("cannot start the upload: {e}")))?;

        let (mut bundle_tx, mut bundle_rx) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn({
            let repo = repo.clone();
            async move {
                let result = repo.write_bundle(&mut bundle_tx).await;
                let _ = bundle_tx.shutdown().await;
                result
            }
        });

        let copy_result: StatusResult<()> = async {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = tokio::io::AsyncReadExt::read(&mut bundle_rx, &mut buf)
                    .await
                    .map_err(|e| Status::internal(format!("cannot read the bundle: {e}")))?;
                if n == 0 {
                    return Ok(());
                }
                upload
                    .write(Bytes::copy_from_slice(&buf[..n]))
                    .await
                    .map_err(|e| Status::internal(format!("cannot upload the bundle: {e}")))?;
            }
        }
        .await;

        let bundle_result = match writer.await {
            Ok(result) => result,
            Err(e) => Err(Status::internal(format!("bundle task failed: {e}"))),
        };

        match bundle_result.and(copy_result) {
            Ok(()) => {
                upload
                    .finish()
                    .await
                    .map_err(|e| Status::internal(format!("cannot commit the bundle: {e}")))?;
                Ok(())
            }
            Err(status) => {
                let _ = upload.abort().await;
                Err(status)
            }
        }
    }

    /// Delete manifests older than the retention window.
    async fn gc_manifests(&self, now_secs: i64) {
        let keys = match self.store.list(&self.manifest_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Error while finding the manifests to GC");
                return;
            }
        };

        let threshold = now_secs - MANIFEST_RETENTION_SECS;
        for key in keys {
            let Some(secs) = timestamp_of(&key) else {
                continue;
            };
            if secs < threshold {
                if let Err(e) = self.store.delete(&key).await {
                    tracing::warn!(key = %key, error = %e, "cannot delete an old manifest");
                }
            }
        }
    }
}

/// The timestamp encoded in an object key's final path segment, if it is
/// one. This is the single rule distinguishing bundle/manifest files from
/// anything else sharing the prefix.
fn timestamp_of(key: &str) -> Option<i64> {
    key.rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_of_parses_zero_padded_names() {
        assert_eq!(timestamp_of("host/repo/000000000042"), Some(42));
        assert_eq!(
            timestamp_of("goblet-repository-manifests/m/001700000000"),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn timestamp_of_rejects_non_numeric_names() {
        assert_eq!(timestamp_of("host/repo/README"), None);
        assert_eq!(timestamp_of("host/repo/1.bak"), None);
    }
}
