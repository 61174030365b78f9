//! Running external processes and other work under a deadline.

use crate::error::{Result, StackError};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// What to do with stderr lines while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrLog {
    Warn,
    Debug,
}

/// Spawn `cmd`, collect its output and enforce `timeout`.
///
/// Exceeding the timeout kills the process and returns [`StackError::Timeout`].
/// A non-zero exit is not an error here; callers inspect `status`.
pub fn run_command(
    mut cmd: Command,
    what: &str,
    workdir: &Path,
    timeout: Duration,
    stderr_log: StderrLog,
) -> Result<ProcessOutput> {
    let mut child = cmd
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let child_pid = child.id();

    // Dedicated readers avoid pipe-buffer deadlocks.
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> String {
        let mut buf = String::new();
        if let Some(mut r) = stdout_handle {
            let _ = r.read_to_string(&mut buf);
        }
        buf
    });
    let unit = workdir.display().to_string();
    let stderr_thread = std::thread::spawn(move || -> String {
        let mut buf = String::new();
        if let Some(r) = stderr_handle {
            for line in BufReader::new(r).lines().map_while(|l| l.ok()) {
                match stderr_log {
                    StderrLog::Warn => tracing::warn!(unit = %unit, "stderr: {line}"),
                    StderrLog::Debug => tracing::debug!(unit = %unit, "stderr: {line}"),
                }
                buf.push_str(&line);
                buf.push('\n');
            }
        }
        buf
    });

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });
    let status = match rx.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(_) => {
            // The waiter and readers see EOF once the process is gone.
            kill_process(child_pid);
            return Err(StackError::Timeout {
                what: what.to_string(),
                workdir: workdir.to_path_buf(),
                timeout,
            });
        }
    };

    Ok(ProcessOutput {
        status,
        stdout: stdout_thread.join().unwrap_or_default(),
        stderr: stderr_thread.join().unwrap_or_default(),
    })
}

fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// Run `f` on its own thread and wait at most `timeout` for it.
///
/// On timeout the thread is left detached; the caller treats the timeout as
/// fatal, so nothing waits for it afterwards.
pub fn with_timeout<T, F>(what: &str, workdir: &Path, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(StackError::Timeout {
            what: what.to_string(),
            workdir: workdir.to_path_buf(),
            timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(StackError::Panicked(what.to_string())),
    }
}
