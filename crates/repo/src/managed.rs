//! A managed repository: one on-disk mirror per upstream.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use goblet_core::protocol::{Command, RefSnapshot, ResponseChunk, parse_response};
use goblet_core::{Code, Status, StatusResult};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::git::{self, io_to_status, run_git, run_git_stdout};
use crate::metrics;
use crate::operation::{NoopOperation, OperationLogger, RunningOperation};
use crate::token::TokenSource;

/// A repository mirror and the coordination around it.
///
/// Writers (`fetch_upstream`, `recover_from_bundle`, one-time
/// initialization) hold the gate exclusively; content queries and local
/// serving read without it. A fetch committing mid-read can therefore be
/// observed by `serve_fetch_local`; combined with ref-in-want that could
/// produce an incomplete packfile, which is why ref-in-want is not
/// advertised.
pub struct ManagedRepository {
    local_path: PathBuf,
    upstream: Url,
    token_source: Arc<dyn TokenSource>,
    operations: Arc<dyn OperationLogger>,
    http: reqwest::Client,
    gate: tokio::sync::RwLock<()>,
    initialized: AtomicBool,
    last_update: std::sync::RwLock<Option<OffsetDateTime>>,
}

impl ManagedRepository {
    pub(crate) fn new(
        local_path: PathBuf,
        upstream: Url,
        token_source: Arc<dyn TokenSource>,
        operations: Arc<dyn OperationLogger>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            local_path,
            upstream,
            token_source,
            operations,
            http,
            gate: tokio::sync::RwLock::new(()),
            initialized: AtomicBool::new(false),
            last_update: std::sync::RwLock::new(None),
        }
    }

    /// Canonical upstream URL of this mirror.
    pub fn upstream_url(&self) -> &Url {
        &self.upstream
    }

    /// On-disk location of the mirror.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// When the last successful upstream fetch started, if any.
    pub fn last_update_time(&self) -> Option<OffsetDateTime> {
        match self.last_update.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn advance_last_update(&self, to: OffsetDateTime) {
        let mut guard = match self.last_update.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none_or(|prev| prev < to) {
            *guard = Some(to);
        }
    }

    /// Create the bare mirror on first use. Runs under the exclusive gate
    /// so openers racing the creator block until the mirror is usable.
    pub(crate) async fn ensure_initialized(&self) -> StatusResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.gate.write().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let exists = tokio::fs::try_exists(&self.local_path).await.map_err(|e| {
            Status::internal(format!("error while initializing local Git repository: {e}"))
        })?;
        if !exists {
            tokio::fs::create_dir_all(&self.local_path)
                .await
                .map_err(|e| Status::internal(format!("cannot create a cache dir: {e}")))?;

            let op = NoopOperation;
            run_git(&op, &self.local_path, &["init", "--bare"]).await?;
            run_git(&op, &self.local_path, &["config", "protocol.version", "2"]).await?;
            run_git(
                &op,
                &self.local_path,
                &["config", "uploadpack.allowfilter", "1"],
            )
            .await?;
            run_git(
                &op,
                &self.local_path,
                &["config", "uploadpack.allowrefinwant", "1"],
            )
            .await?;
            run_git(
                &op,
                &self.local_path,
                &["config", "repack.writebitmaps", "1"],
            )
            .await?;
            // libcurl and HTTP/2 do not get along for large fetches.
            run_git(
                &op,
                &self.local_path,
                &["config", "http.version", "HTTP/1.1"],
            )
            .await?;
            run_git(
                &op,
                &self.local_path,
                &[
                    "remote",
                    "add",
                    "--mirror=fetch",
                    "origin",
                    self.upstream.as_str(),
                ],
            )
            .await?;
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Forward the client's `ls-refs` command to upstream and parse the
    /// response chunks.
    pub async fn ls_refs_upstream(&self, command: &Command) -> StatusResult<Vec<ResponseChunk>> {
        let token = self.token_source.token().await?;

        let endpoint = format!(
            "{}/git-upload-pack",
            self.upstream.as_str().trim_end_matches('/')
        );
        let mut request = self
            .http
            .post(&endpoint)
            .header("Content-Type", "application/x-git-upload-pack-request")
            .header("Accept", "application/x-git-upload-pack-result")
            .header("Git-Protocol", "version=2")
            .body(command.encode_pktline());
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let started = Instant::now();
        let response = request.send().await;
        let code = if response.is_ok() {
            Code::Ok
        } else {
            Code::Unavailable
        };
        metrics::record_outbound("ls-refs", code, started);

        let response = response
            .map_err(|e| Status::internal(format!("cannot send a request to the upstream: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let mut message = String::new();
            let is_text = response
                .headers()
                .get("Content-Type")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/plain"));
            if is_text {
                message = response.text().await.unwrap_or_default();
            }
            return Err(Status::internal(format!(
                "got a non-OK response from the upstream: {status} {message}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Status::internal(format!("cannot read the upstream response: {e}")))?;
        parse_response(&body)
            .map_err(|e| Status::internal(format!("cannot parse the upstream response: {e}")))
    }

    /// Fetch everything from upstream into the mirror.
    ///
    /// Holds the exclusive gate, so at most one fetch per repository runs
    /// at a time; that lock is the whole of the fetch-coalescing
    /// machinery. On success `last_update` advances to the fetch start
    /// time.
    pub async fn fetch_upstream(&self) -> StatusResult<()> {
        let op = self.operations.start("FetchUpstream", &self.upstream);
        let result = self.fetch_upstream_inner(op.as_ref()).await;
        op.done(result.as_ref().err());
        result
    }

    async fn fetch_upstream_inner(&self, op: &dyn RunningOperation) -> StatusResult<()> {
        // The very first fetch of a large repository is pathologically slow
        // when done as one mirror fetch; fetch heads and changes first when
        // the mirror is still empty.
        let split_fetch = self.is_empty().await?;

        let start_wall = OffsetDateTime::now_utc();
        let started = Instant::now();
        let _guard = self.gate.write().await;

        let result = async {
            if split_fetch {
                self.run_fetch(
                    op,
                    true,
                    &["refs/heads/*:refs/heads/*", "refs/changes/*:refs/changes/*"],
                )
                .await?;
            }
            self.run_fetch(op, false, &[]).await
        }
        .await;

        let code = match &result {
            Ok(()) => Code::Ok,
            Err(status) => status.code,
        };
        metrics::record_outbound("fetch", code, started);

        if result.is_ok() {
            self.advance_last_update(start_wall);
        }
        result
    }

    async fn run_fetch(
        &self,
        op: &dyn RunningOperation,
        no_tags: bool,
        refspecs: &[&str],
    ) -> StatusResult<()> {
        // A fresh token per invocation; upstream credentials may be
        // short-lived.
        let header = self
            .token_source
            .token()
            .await?
            .map(|token| format!("http.extraHeader=Authorization: Bearer {token}"));

        let mut args: Vec<&str> = Vec::new();
        if let Some(header) = header.as_deref() {
            args.push("-c");
            args.push(header);
        }
        args.extend(["fetch", "--progress", "-f"]);
        if no_tags {
            args.push("-n");
        }
        args.push("origin");
        args.extend(refspecs);

        run_git(op, &self.local_path, &args).await
    }

    /// Whether any advertised ref is new or different locally.
    pub async fn has_any_update(&self, refs: &RefSnapshot) -> StatusResult<bool> {
        let path = self.local_path.clone();
        let refs = refs.clone();
        spawn_git2(move || {
            let repo = open_repo(&path)?;
            for (refname, hash) in &refs {
                let local = match repo.refname_to_id(refname) {
                    Ok(oid) => oid,
                    Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(true),
                    Err(e) => {
                        return Err(Status::internal(format!("cannot open the reference: {e}")));
                    }
                };
                // An unparseable id (e.g. an unborn HEAD) counts as changed.
                match git2::Oid::from_str(hash) {
                    Ok(remote) if remote == local => {}
                    _ => return Ok(true),
                }
            }
            Ok(false)
        })
        .await
    }

    /// Whether every wanted object id is present and every wanted ref name
    /// resolves locally.
    pub async fn has_all_wants(&self, oids: &[String], refnames: &[String]) -> StatusResult<bool> {
        let path = self.local_path.clone();
        let oids = oids.to_vec();
        let refnames = refnames.to_vec();
        spawn_git2(move || {
            let repo = open_repo(&path)?;
            let odb = repo
                .odb()
                .map_err(|e| Status::internal(format!("cannot open the object database: {e}")))?;

            for oid in &oids {
                let oid = git2::Oid::from_str(oid).map_err(|e| {
                    Status::internal(format!("error while looking up an object for want check: {e}"))
                })?;
                if !odb.exists(oid) {
                    return Ok(false);
                }
            }

            for refname in &refnames {
                match repo.refname_to_id(refname) {
                    Ok(_) => {}
                    Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(false),
                    Err(e) => {
                        return Err(Status::internal(format!(
                            "error while looking up a reference for want check: {e}"
                        )));
                    }
                }
            }
            Ok(true)
        })
        .await
    }

    async fn is_empty(&self) -> StatusResult<bool> {
        let path = self.local_path.clone();
        spawn_git2(move || {
            let repo = open_repo(&path)?;
            match repo.head() {
                Ok(_) => Ok(false),
                Err(e)
                    if matches!(
                        e.code(),
                        git2::ErrorCode::NotFound | git2::ErrorCode::UnbornBranch
                    ) =>
                {
                    Ok(true)
                }
                Err(e) => Err(Status::internal(format!("cannot resolve HEAD: {e}"))),
            }
        })
        .await
    }

    /// Serve a fetch command from the mirror via
    /// `git upload-pack --stateless-rpc`, streaming the response to `out`.
    pub async fn serve_fetch_local<W>(&self, command: &Command, out: &mut W) -> StatusResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let request = command.encode_pktline();

        let mut child = tokio::process::Command::new(&*git::GIT_BINARY)
            .arg("upload-pack")
            .arg("--stateless-rpc")
            .arg(&self.local_path)
            .env_clear()
            .env("GIT_PROTOCOL", "version=2")
            .current_dir(&self.local_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Status::internal(format!("failed to run a git command: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Status::internal("git stdin is not piped"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Status::internal("git stdout is not piped"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Status::internal("git stderr is not piped"))?;

        let feed = async move {
            stdin.write_all(&request).await?;
            stdin.shutdown().await?;
            Ok::<_, std::io::Error>(())
        };
        let mut stderr_buf = String::new();
        let drain_stderr = async {
            let _ = stderr.read_to_string(&mut stderr_buf).await;
        };
        let copy = tokio::io::copy(&mut stdout, out);

        let (feed_result, copy_result, _) = tokio::join!(feed, copy, drain_stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| Status::internal(format!("failed to run a git command: {e}")))?;
        if !status.success() {
            return Err(Status::internal(format!(
                "git upload-pack exited with {status}: {}",
                stderr_buf.trim()
            )));
        }
        copy_result.map_err(io_to_status)?;
        feed_result.map_err(io_to_status)?;
        Ok(())
    }

    /// Stream a bundle of all refs to `out`.
    pub async fn write_bundle<W>(&self, out: &mut W) -> StatusResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let op = self.operations.start("CreateBundle", &self.upstream);
        let result = run_git_stdout(
            op.as_ref(),
            out,
            &self.local_path,
            &["bundle", "create", "-", "--all"],
        )
        .await;
        op.done(result.as_ref().err());
        result
    }

    /// Fetch all refs from a bundle file into the mirror.
    pub async fn recover_from_bundle(&self, bundle_path: &Path) -> StatusResult<()> {
        let op = self.operations.start("ReadBundle", &self.upstream);
        let result = async {
            let bundle = bundle_path
                .to_str()
                .ok_or_else(|| Status::internal("bundle path is not UTF-8"))?;
            let _guard = self.gate.write().await;
            run_git(
                op.as_ref(),
                &self.local_path,
                &["fetch", "--progress", "-f", bundle, "refs/*:refs/*"],
            )
            .await
        }
        .await;
        op.done(result.as_ref().err());
        result
    }
}

fn open_repo(path: &Path) -> StatusResult<git2::Repository> {
    git2::Repository::open(path)
        .map_err(|e| Status::internal(format!("cannot open the local cached repository: {e}")))
}

async fn spawn_git2<T, F>(f: F) -> StatusResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StatusResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Status::internal(format!("repository query task failed: {e}")))?
}
