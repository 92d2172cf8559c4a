//! Managed repository and registry behavior against a real git binary.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::GitRepo;
use goblet_core::canonical::UrlCanonicalizer;
use goblet_core::config::UpstreamTokenConfig;
use goblet_core::{Status, StatusResult, parse_all_commands};
use goblet_repo::{ConfigTokenSource, Registry, TracingOperationLogger};
use tempfile::TempDir;
use url::Url;

/// Canonicalizer that maps every client URL to one fixed upstream.
struct FixedCanonicalizer {
    upstream: Url,
}

impl UrlCanonicalizer for FixedCanonicalizer {
    fn canonicalize(&self, _url: &Url) -> StatusResult<Url> {
        Ok(self.upstream.clone())
    }
}

fn file_url(path: &std::path::Path) -> Url {
    Url::parse(&format!("file://{}", path.display())).unwrap()
}

fn registry_for(upstream: Url, cache_root: PathBuf) -> Registry {
    Registry::new(
        cache_root,
        Arc::new(FixedCanonicalizer { upstream }),
        Arc::new(ConfigTokenSource::new(UpstreamTokenConfig::None)),
        Arc::new(TracingOperationLogger),
    )
}

fn client_url() -> Url {
    Url::parse("https://git.example.com/project").unwrap()
}

#[tokio::test]
async fn open_or_create_initializes_bare_mirror() {
    let upstream = GitRepo::init_bare().await;
    let cache = TempDir::new().unwrap();
    let registry = registry_for(file_url(upstream.path()), cache.path().to_path_buf());

    let repo = registry.open_or_create(&client_url()).await.unwrap();

    let mirror = git2::Repository::open(repo.local_path()).unwrap();
    assert!(mirror.is_bare());
    let config = mirror.config().unwrap();
    assert_eq!(config.get_string("protocol.version").unwrap(), "2");
    assert!(config.get_bool("uploadpack.allowfilter").unwrap());
    assert!(config.get_bool("uploadpack.allowrefinwant").unwrap());
    assert!(config.get_bool("repack.writebitmaps").unwrap());
    assert_eq!(config.get_string("http.version").unwrap(), "HTTP/1.1");
    assert_eq!(
        config.get_string("remote.origin.url").unwrap(),
        repo.upstream_url().as_str()
    );
}

#[tokio::test]
async fn concurrent_opens_share_one_handle() {
    let upstream = GitRepo::init_bare().await;
    let cache = TempDir::new().unwrap();
    let registry = Arc::new(registry_for(
        file_url(upstream.path()),
        cache.path().to_path_buf(),
    ));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry.open_or_create(&client_url()).await.unwrap()
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }
    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle));
    }
    assert_eq!(registry.list().await.len(), 1);
}

#[tokio::test]
async fn fetch_brings_wants_local_and_advances_last_update() {
    let upstream = GitRepo::init_bare().await;
    let pusher = GitRepo::init_local().await;
    let hash = pusher.create_random_commit().await;
    pusher
        .run(&[
            "push",
            "-f",
            upstream.path().to_str().unwrap(),
            "master:master",
        ])
        .await;

    let cache = TempDir::new().unwrap();
    let registry = registry_for(file_url(upstream.path()), cache.path().to_path_buf());
    let repo = registry.open_or_create(&client_url()).await.unwrap();

    assert!(!repo.has_all_wants(&[hash.clone()], &[]).await.unwrap());
    assert!(repo.last_update_time().is_none());

    repo.fetch_upstream().await.unwrap();

    assert!(repo.has_all_wants(&[hash.clone()], &[]).await.unwrap());
    assert!(
        repo.has_all_wants(&[], &["refs/heads/master".to_string()])
            .await
            .unwrap()
    );
    assert!(
        !repo
            .has_all_wants(&[], &["refs/heads/missing".to_string()])
            .await
            .unwrap()
    );
    let first_update = repo.last_update_time().expect("last_update after fetch");

    // A later fetch never rewinds the timestamp.
    repo.fetch_upstream().await.unwrap();
    assert!(repo.last_update_time().unwrap() >= first_update);
}

#[tokio::test]
async fn has_any_update_compares_against_local_refs() {
    let upstream = GitRepo::init_bare().await;
    let pusher = GitRepo::init_local().await;
    let hash = pusher.create_random_commit().await;
    pusher
        .run(&[
            "push",
            "-f",
            upstream.path().to_str().unwrap(),
            "master:master",
        ])
        .await;

    let cache = TempDir::new().unwrap();
    let registry = registry_for(file_url(upstream.path()), cache.path().to_path_buf());
    let repo = registry.open_or_create(&client_url()).await.unwrap();

    let mut snapshot = goblet_core::RefSnapshot::new();
    snapshot.insert("refs/heads/master".to_string(), hash.clone());

    // Mirror is empty: everything counts as an update.
    assert!(repo.has_any_update(&snapshot).await.unwrap());

    repo.fetch_upstream().await.unwrap();
    assert!(!repo.has_any_update(&snapshot).await.unwrap());

    let mut changed = goblet_core::RefSnapshot::new();
    changed.insert(
        "refs/heads/master".to_string(),
        "89abcdef0123456789abcdef0123456789abcdef".to_string(),
    );
    assert!(repo.has_any_update(&changed).await.unwrap());

    let mut new_ref = goblet_core::RefSnapshot::new();
    new_ref.insert("refs/heads/feature".to_string(), hash);
    assert!(repo.has_any_update(&new_ref).await.unwrap());
}

#[tokio::test]
async fn serve_fetch_local_returns_a_packfile() {
    let upstream = GitRepo::init_bare().await;
    let pusher = GitRepo::init_local().await;
    let hash = pusher.create_random_commit().await;
    pusher
        .run(&[
            "push",
            "-f",
            upstream.path().to_str().unwrap(),
            "master:master",
        ])
        .await;

    let cache = TempDir::new().unwrap();
    let registry = registry_for(file_url(upstream.path()), cache.path().to_path_buf());
    let repo = registry.open_or_create(&client_url()).await.unwrap();
    repo.fetch_upstream().await.unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(format!("{:04x}command=fetch\n", 4 + 14).as_bytes());
    body.extend_from_slice(b"0001");
    let want = format!("want {hash}\n");
    body.extend_from_slice(format!("{:04x}{want}", 4 + want.len()).as_bytes());
    body.extend_from_slice(format!("{:04x}done\n", 4 + 5).as_bytes());
    body.extend_from_slice(b"0000");
    let commands = parse_all_commands(&body).unwrap();

    let mut out = Vec::new();
    repo.serve_fetch_local(&commands[0], &mut out).await.unwrap();

    let response = String::from_utf8_lossy(&out);
    assert!(response.contains("packfile"), "no packfile section: {response}");
}

#[tokio::test]
async fn bundle_roundtrip_restores_mirror() {
    let upstream = GitRepo::init_bare().await;
    let pusher = GitRepo::init_local().await;
    let hash = pusher.create_random_commit().await;
    pusher
        .run(&[
            "push",
            "-f",
            upstream.path().to_str().unwrap(),
            "master:master",
        ])
        .await;

    let cache_a = TempDir::new().unwrap();
    let registry_a = registry_for(file_url(upstream.path()), cache_a.path().to_path_buf());
    let repo_a = registry_a.open_or_create(&client_url()).await.unwrap();
    repo_a.fetch_upstream().await.unwrap();

    let mut bundle = Vec::new();
    repo_a.write_bundle(&mut bundle).await.unwrap();
    assert!(!bundle.is_empty());

    let scratch = TempDir::new().unwrap();
    let bundle_path = scratch.path().join("tmp-bundle");
    tokio::fs::write(&bundle_path, &bundle).await.unwrap();

    let cache_b = TempDir::new().unwrap();
    let registry_b = registry_for(file_url(upstream.path()), cache_b.path().to_path_buf());
    let repo_b = registry_b.open_or_create(&client_url()).await.unwrap();
    assert!(!repo_b.has_all_wants(&[hash.clone()], &[]).await.unwrap());

    repo_b.recover_from_bundle(&bundle_path).await.unwrap();

    assert!(repo_b.has_all_wants(&[hash], &[]).await.unwrap());
    assert!(
        repo_b
            .has_all_wants(&[], &["refs/heads/master".to_string()])
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn failed_fetch_leaves_last_update_unset() {
    let missing = TempDir::new().unwrap();
    let gone = missing.path().join("gone");
    let cache = TempDir::new().unwrap();
    let registry = registry_for(file_url(&gone), cache.path().to_path_buf());
    let repo = registry.open_or_create(&client_url()).await.unwrap();

    let err: Status = repo.fetch_upstream().await.unwrap_err();
    assert_eq!(err.code, goblet_core::Code::Internal);
    assert!(repo.last_update_time().is_none());
}
