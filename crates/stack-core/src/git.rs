//! Repository fetching through the `git` binary.

use crate::error::{Result, StackError};
use crate::process::{self, StderrLog};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

fn git_bin() -> Result<PathBuf> {
    which::which("git").map_err(|_| StackError::ToolNotInstalled("git"))
}

/// Clone `url` into `dir` (or fetch when a clone is already there) and check
/// out `reference`. The whole sequence shares one `timeout`.
pub fn sync_repo(url: &str, reference: &str, dir: &Path, timeout: Duration) -> Result<()> {
    let git = git_bin()?;
    let deadline = std::time::Instant::now() + timeout;
    let remaining = || deadline.saturating_duration_since(std::time::Instant::now());

    if dir.join(".git").is_dir() {
        tracing::debug!(repo = %url, dir = %dir.display(), "fetching");
        run_git(&git, dir, &["fetch", "--all", "--tags", "--prune"], remaining())?;
    } else {
        let parent = dir.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        tracing::info!(repo = %url, dir = %dir.display(), "cloning");
        let target = dir.to_string_lossy();
        run_git(&git, parent, &["clone", "--quiet", url, &target], remaining())?;
    }
    run_git(&git, dir, &["checkout", "--quiet", reference], remaining())
}

fn run_git(git: &Path, cwd: &Path, args: &[&str], timeout: Duration) -> Result<()> {
    let mut cmd = Command::new(git);
    cmd.args(args);
    let what = format!("git {}", args.first().copied().unwrap_or_default());
    let out = process::run_command(cmd, &what, cwd, timeout, StderrLog::Debug)?;
    if !out.status.success() {
        return Err(StackError::ToolFailed {
            tool: "git",
            reason: format!("{what}: {}", out.stderr.trim()),
        });
    }
    Ok(())
}
