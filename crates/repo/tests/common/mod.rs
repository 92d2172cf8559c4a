//! Git fixtures shared by integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::TempDir;

static COMMIT_SEQ: AtomicU64 = AtomicU64::new(0);

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
        run_git_in(self.path(), args).await
    }

    /// Create an empty commit with a unique message; returns its hash.
    pub async fn create_random_commit(&self) -> String {
        let seq = COMMIT_SEQ.fetch_add(1, Ordering::Relaxed);
        let message = format!("commit {seq} at {:?}", std::time::SystemTime::now());
        self.run(&["commit", "--allow-empty", "--message", &message])
            .await;
        self.run(&["rev-parse", "HEAD"]).await.trim().to_string()
    }
}

pub async fn run_git_in(dir: &Path, args: &[&str]) -> String {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("HOME", dir)
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
