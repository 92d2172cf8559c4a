//! Running the `git` binary.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use goblet_core::{Status, StatusResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;

use crate::operation::RunningOperation;

/// Absolute path of the git binary, resolved from PATH once at startup.
/// Child processes run with a cleared environment, so the lookup cannot
/// happen at spawn time.
pub(crate) static GIT_BINARY: LazyLock<PathBuf> = LazyLock::new(|| {
    let path = std::env::var_os("PATH").unwrap_or_else(|| OsString::from("/usr/bin:/bin"));
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join("git");
        if candidate.is_file() {
            return candidate;
        }
    }
    PathBuf::from("git")
});

fn command(git_dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(&*GIT_BINARY);
    cmd.args(args);
    cmd.env_clear();
    cmd.current_dir(git_dir);
    cmd.kill_on_drop(true);
    cmd
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, op: &dyn RunningOperation) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        op.progress(&line);
    }
}

/// Run a git command in `git_dir`, feeding its combined output to `op`.
pub(crate) async fn run_git(
    op: &dyn RunningOperation,
    git_dir: &Path,
    args: &[&str],
) -> StatusResult<()> {
    let mut child = command(git_dir, args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Status::internal(format!("failed to run a git command: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let pump = async {
        match (stdout, stderr) {
            (Some(out), Some(err)) => {
                tokio::join!(forward_lines(out, op), forward_lines(err, op));
            }
            _ => {}
        }
    };

    let (_, status) = tokio::join!(pump, child.wait());
    let status =
        status.map_err(|e| Status::internal(format!("failed to run a git command: {e}")))?;
    if !status.success() {
        return Err(Status::internal(format!(
            "failed to run a git command: git {} exited with {status}",
            args.first().copied().unwrap_or_default()
        )));
    }
    Ok(())
}

/// Run a git command streaming its stdout into `out`; stderr goes to `op`.
pub(crate) async fn run_git_stdout<W>(
    op: &dyn RunningOperation,
    out: &mut W,
    git_dir: &Path,
    args: &[&str],
) -> StatusResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut child = command(git_dir, args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Status::internal(format!("failed to run a git command: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Status::internal("git stdout is not piped"))?;
    let stderr = child.stderr.take();

    let copy = tokio::io::copy(&mut stdout, out);
    let pump = async {
        if let Some(err) = stderr {
            forward_lines(err, op).await;
        }
    };
    let (copy_result, _, status) = tokio::join!(copy, pump, child.wait());

    let status =
        status.map_err(|e| Status::internal(format!("failed to run a git command: {e}")))?;
    if !status.success() {
        return Err(Status::internal(format!(
            "failed to run a git command: git {} exited with {status}",
            args.first().copied().unwrap_or_default()
        )));
    }
    copy_result.map_err(io_to_status)?;
    Ok(())
}

/// Map an I/O error from the response path to a canonical status. A broken
/// pipe means the client went away.
pub(crate) fn io_to_status(err: std::io::Error) -> Status {
    if err.kind() == std::io::ErrorKind::BrokenPipe {
        Status::canceled("client IO error")
    } else {
        Status::internal(format!("IO error: {err}"))
    }
}
