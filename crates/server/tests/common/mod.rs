//! End-to-end fixtures: a git-backed upstream HTTP server and a proxy
//! wired to it.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use goblet_core::HostCanonicalizer;
use goblet_core::config::{AppConfig, UpstreamTokenConfig};
use goblet_repo::{ConfigTokenSource, Registry, TracingOperationLogger};
use goblet_server::{AppState, BearerTokenAuthorizer, LogErrorSink, create_router};
use tempfile::TempDir;
use url::Url;

pub const VALID_CLIENT_TOKEN: &str = "test-client-token";
pub const VALID_SERVER_TOKEN: &str = "valid-server-auth-token";

static COMMIT_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A scratch git repository on disk.
pub struct GitRepo {
    dir: TempDir,
}

impl GitRepo {
    pub async fn init_bare() -> Self {
        let repo = Self {
            dir: TempDir::new().unwrap(),
        };
        repo.run(&["init", "--bare", "-b", "master"]).await;
        repo
    }

    pub async fn init_local() -> Self {
        let repo = Self {
            dir: TempDir::new().unwrap(),
        };
        repo.run(&["init", "-b", "master"]).await;
        repo.run(&["config", "user.email", "local-root@example.com"])
            .await;
        repo.run(&["config", "user.name", "local root"]).await;
        repo.run(&["config", "protocol.version", "2"]).await;
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn run(&self, args: &[&str]) -> String {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(self.path())
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("HOME", self.path())
            .output()
            .await
            .expect("cannot execute git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}{}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    pub async fn create_random_commit(&self) -> String {
        let seq = COMMIT_SEQ.fetch_add(1, Ordering::Relaxed);
        let message = format!("commit {seq} at {:?}", std::time::SystemTime::now());
        self.run(&["commit", "--allow-empty", "--message", &message])
            .await;
        self.run(&["rev-parse", "HEAD"]).await.trim().to_string()
    }

    /// Fetch through the proxy with the client credential.
    pub async fn fetch_via_proxy(&self, url: &str, refspec: Option<&str>) -> String {
        let auth = format!("http.extraHeader=Authorization: Bearer {VALID_CLIENT_TOKEN}");
        let mut args: Vec<&str> = vec!["-c", &auth, "fetch", url];
        if let Some(refspec) = refspec {
            args.push(refspec);
        }
        self.run(&args).await;
        self.run(&["rev-parse", "FETCH_HEAD"]).await.trim().to_string()
    }
}

#[derive(Clone)]
struct UpstreamState {
    dir: PathBuf,
    ls_refs_requests: Arc<AtomicUsize>,
    fetch_requests: Arc<AtomicUsize>,
}

/// A minimal Smart HTTP v2 upstream backed by `git upload-pack`.
async fn upstream_handler(State(state): State<UpstreamState>, req: Request) -> Response {
    let expected = format!("Bearer {VALID_SERVER_TOKEN}");
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str());
    if !authorized {
        return (StatusCode::FORBIDDEN, "invalid authenticator").into_response();
    }

    let path = req.uri().path().to_string();
    if path.ends_with("/info/refs") {
        let advert = run_upload_pack(&state.dir, &["--advertise-refs"], &[]).await;
        return (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-advertisement",
            )],
            Body::from(advert),
        )
            .into_response();
    }

    if path.ends_with("/git-upload-pack") {
        let gzipped = req
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            == Some("gzip");
        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if gzipped {
            use tokio::io::AsyncReadExt;
            let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).await.unwrap();
            out
        } else {
            body.to_vec()
        };

        if contains(&body, b"command=ls-refs") {
            state.ls_refs_requests.fetch_add(1, Ordering::SeqCst);
        }
        if contains(&body, b"command=fetch") {
            state.fetch_requests.fetch_add(1, Ordering::SeqCst);
        }

        let output = run_upload_pack(&state.dir, &[], &body).await;
        return (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-result",
            )],
            Body::from(output),
        )
            .into_response();
    }

    (StatusCode::NOT_FOUND, "no such endpoint").into_response()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

async fn run_upload_pack(dir: &Path, extra_args: &[&str], stdin: &[u8]) -> Vec<u8> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new("git")
        .arg("upload-pack")
        .arg("--stateless-rpc")
        .args(extra_args)
        .arg(".")
        .current_dir(dir)
        .env("GIT_PROTOCOL", "version=2")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("cannot spawn git upload-pack");

    let mut child_stdin = child.stdin.take().unwrap();
    child_stdin.write_all(stdin).await.unwrap();
    child_stdin.shutdown().await.unwrap();
    drop(child_stdin);

    let output = child.wait_with_output().await.unwrap();
    assert!(
        output.status.success(),
        "git upload-pack failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output.stdout
}

/// The full fixture: upstream server, proxy server, shared registry.
pub struct TestServer {
    pub upstream_repo: GitRepo,
    pub upstream_url: String,
    pub proxy_url: String,
    pub registry: Arc<Registry>,
    pub cache_dir: TempDir,
    ls_refs_requests: Arc<AtomicUsize>,
    fetch_requests: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start() -> Self {
        let upstream_repo = GitRepo::init_bare().await;
        upstream_repo
            .run(&["config", "uploadpack.allowfilter", "1"])
            .await;

        let ls_refs_requests = Arc::new(AtomicUsize::new(0));
        let fetch_requests = Arc::new(AtomicUsize::new(0));
        let upstream_state = UpstreamState {
            dir: upstream_repo.path().to_path_buf(),
            ls_refs_requests: ls_refs_requests.clone(),
            fetch_requests: fetch_requests.clone(),
        };
        let upstream_app = Router::new()
            .fallback(upstream_handler)
            .with_state(upstream_state);
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_url = format!("http://{}", upstream_listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(upstream_listener, upstream_app).await.unwrap();
        });

        let cache_dir = TempDir::new().unwrap();
        let mut config = AppConfig::for_testing(cache_dir.path().to_path_buf());
        config.upstream.token = UpstreamTokenConfig::Value {
            token: VALID_SERVER_TOKEN.to_string(),
        };

        let registry = Arc::new(Registry::new(
            cache_dir.path().to_path_buf(),
            Arc::new(HostCanonicalizer::with_override_base(
                Url::parse(&upstream_url).unwrap(),
            )),
            Arc::new(ConfigTokenSource::new(config.upstream.token.clone())),
            Arc::new(TracingOperationLogger),
        ));

        let authorizer = Arc::new(BearerTokenAuthorizer::new(config.auth.token_hash.clone()));
        let state = AppState::new(config, registry.clone(), authorizer, Arc::new(LogErrorSink));
        let proxy_app = create_router(state);
        let proxy_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_url = format!("http://{}", proxy_listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(proxy_listener, proxy_app).await.unwrap();
        });

        Self {
            upstream_repo,
            upstream_url,
            proxy_url,
            registry,
            cache_dir,
            ls_refs_requests,
            fetch_requests,
        }
    }

    /// Push a fresh commit to the upstream; returns its hash.
    pub async fn create_random_commit_upstream(&self) -> String {
        let pusher = GitRepo::init_local().await;
        let hash = pusher.create_random_commit().await;
        pusher
            .run(&[
                "push",
                "-f",
                self.upstream_repo.path().to_str().unwrap(),
                "master:master",
            ])
            .await;
        hash
    }

    /// The proxy URL for the test repository.
    pub fn repo_url(&self) -> String {
        format!("{}/project.git", self.proxy_url)
    }

    pub fn upstream_fetch_requests(&self) -> usize {
        self.fetch_requests.load(Ordering::SeqCst)
    }

    pub fn upstream_ls_refs_requests(&self) -> usize {
        self.ls_refs_requests.load(Ordering::SeqCst)
    }

    /// Wait until no upstream fetch has happened for a little while, so
    /// request counts are stable before an assertion.
    pub async fn settle(&self) {
        let mut last = self.upstream_fetch_requests();
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            let now = self.upstream_fetch_requests();
            if now == last {
                return;
            }
            last = now;
        }
    }
}
