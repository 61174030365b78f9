//! Shared state for one orchestration run.
//!
//! Everything that is process-wide (flags, status table, wait-groups,
//! cancellation, the exit code) lives on a [`Runtime`] that every unit holds
//! by `Arc`. Nothing here is a global.

use crate::expr::{Evaluator, JinjaEvaluator};
use crate::paths;
use crate::signals::{CancelToken, SignalRegistry};
use crate::status::StatusRegistry;
use serde_json::{Map, Value};
use std::io::Write;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub const EXIT_FATAL: i32 = 1;
pub const EXIT_ACTION_FAILED: i32 = 3;
pub const EXIT_INTERRUPTED: i32 = 130;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute directory of the root unit.
    pub root: PathBuf,
    /// Extra var files merged into the root unit, in order.
    pub var_files: Vec<PathBuf>,
    /// Raw `key=value[,key=value]` overrides merged last.
    pub set_values: Vec<String>,
    /// Where git-backed libs are cloned.
    pub gitlibs_dir: PathBuf,
    /// Default for wait and run timeouts.
    pub default_timeout: Duration,
}

impl Settings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            gitlibs_dir: root.join(paths::DEFAULT_GITLIBS_DIR),
            root,
            var_files: Vec::new(),
            set_values: Vec::new(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn gitclone_dir(&self) -> PathBuf {
        self.root.join(paths::GITCLONE_DIR)
    }
}

// ---------------------------------------------------------------------------
// Output sinks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkTarget {
    Stdout,
    Stderr,
    Memory,
}

/// A standard stream, or an in-memory buffer for tests. Each block is
/// written under the sink's lock so concurrent actions never interleave.
#[derive(Debug)]
pub struct Sink {
    target: SinkTarget,
    buf: Mutex<Vec<u8>>,
}

impl Sink {
    fn new(target: SinkTarget) -> Self {
        Self {
            target,
            buf: Mutex::new(Vec::new()),
        }
    }

    pub fn write_block(&self, text: &str) -> std::io::Result<()> {
        let mut buf = lock(&self.buf);
        let newline: &[u8] = if text.ends_with('\n') { b"" } else { b"\n" };
        match self.target {
            SinkTarget::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(text.as_bytes())?;
                out.write_all(newline)?;
                out.flush()
            }
            SinkTarget::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(text.as_bytes())?;
                err.write_all(newline)
            }
            SinkTarget::Memory => {
                buf.extend_from_slice(text.as_bytes());
                buf.extend_from_slice(newline);
                Ok(())
            }
        }
    }

    /// Everything written so far (memory sinks only).
    pub fn captured(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buf)).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    settings: Settings,
    status: StatusRegistry,
    signals: Arc<SignalRegistry>,
    flags: Mutex<Map<String, Value>>,
    cancel: CancelToken,
    exit_code: AtomicI32,
    next_id: AtomicU64,
    git_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    stdout: Sink,
    stderr: Sink,
    evaluator: Box<dyn Evaluator>,
}

impl Runtime {
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::build(settings, SinkTarget::Stdout, SinkTarget::Stderr)
    }

    /// Runtime whose stdout/stderr sinks are in-memory buffers.
    pub fn capturing(settings: Settings) -> Arc<Self> {
        Self::build(settings, SinkTarget::Memory, SinkTarget::Memory)
    }

    fn build(settings: Settings, stdout: SinkTarget, stderr: SinkTarget) -> Arc<Self> {
        let signals = Arc::new(SignalRegistry::default());
        let cancel = CancelToken::default();
        let evaluator = Box::new(JinjaEvaluator::new(Arc::clone(&signals), cancel.clone()));
        Arc::new(Self {
            settings,
            status: StatusRegistry::default(),
            signals,
            flags: Mutex::new(Map::new()),
            cancel,
            exit_code: AtomicI32::new(0),
            next_id: AtomicU64::new(0),
            git_locks: Mutex::new(HashMap::new()),
            stdout: Sink::new(stdout),
            stderr: Sink::new(stderr),
            evaluator,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> &StatusRegistry {
        &self.status
    }

    pub fn signals(&self) -> &SignalRegistry {
        &self.signals
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    pub fn stdout(&self) -> &Sink {
        &self.stdout
    }

    pub fn stderr(&self) -> &Sink {
        &self.stderr
    }

    pub fn next_unit_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("stack_{n}")
    }

    pub fn flags(&self) -> Map<String, Value> {
        lock(&self.flags).clone()
    }

    pub fn with_flags<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut lock(&self.flags))
    }

    /// Run `f` holding the git lock of checkout directory `dir`. Operations on
    /// different directories do not wait for each other.
    pub fn with_git_lock<R>(&self, dir: &Path, f: impl FnOnce() -> R) -> R {
        let key = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
        let dir_lock = Arc::clone(lock(&self.git_locks).entry(key).or_default());
        let _guard = lock(&dir_lock);
        f()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// External interrupt: record the exit code and cancel.
    pub fn interrupt(&self) {
        self.record_exit(EXIT_INTERRUPTED);
        self.cancel.cancel();
    }

    /// A fatal error was raised somewhere; let every peer wind down.
    pub fn abort(&self) {
        self.record_exit(EXIT_FATAL);
        self.cancel.cancel();
    }

    /// An action failed locally; the run goes on but must exit non-zero.
    pub fn record_action_failure(&self) {
        self.record_exit(EXIT_ACTION_FAILED);
    }

    /// First recorded code wins.
    fn record_exit(&self, code: i32) {
        let _ = self
            .exit_code
            .compare_exchange(0, code, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_ids_are_monotonic() {
        let rt = Runtime::capturing(Settings::new("/tmp"));
        assert_eq!(rt.next_unit_id(), "stack_1");
        assert_eq!(rt.next_unit_id(), "stack_2");
    }

    #[test]
    fn first_exit_code_wins() {
        let rt = Runtime::capturing(Settings::new("/tmp"));
        assert_eq!(rt.exit_code(), 0);
        rt.record_action_failure();
        rt.interrupt();
        assert_eq!(rt.exit_code(), EXIT_ACTION_FAILED);
        assert!(rt.is_cancelled());
    }

    #[test]
    fn git_locks_are_per_directory() {
        let rt = Runtime::capturing(Settings::new("/tmp"));
        let (tx, rx) = std::sync::mpsc::channel();
        rt.with_git_lock(Path::new("/tmp/a"), || {
            let other = Arc::clone(&rt);
            let tx_b = tx.clone();
            let handle = std::thread::spawn(move || {
                other.with_git_lock(Path::new("/tmp/b"), || tx_b.send("b").unwrap());
            });
            // Another directory is not blocked by the held lock.
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "b");
            handle.join().unwrap();

            let same = Arc::clone(&rt);
            let tx = tx.clone();
            let handle = std::thread::spawn(move || {
                same.with_git_lock(Path::new("/tmp/a"), || tx.send("a").unwrap());
            });
            assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
            handle
        })
        .join()
        .unwrap();
        assert_eq!(rx.recv().unwrap(), "a");
    }

    #[test]
    fn memory_sink_terminates_blocks() {
        let rt = Runtime::capturing(Settings::new("/tmp"));
        rt.stdout().write_block("a").unwrap();
        rt.stdout().write_block("b\n").unwrap();
        assert_eq!(rt.stdout().captured(), "a\nb\n");
    }

    #[test]
    fn settings_derive_dirs_from_root() {
        let s = Settings::new("/work");
        assert_eq!(s.gitclone_dir(), PathBuf::from("/work/.gitclone"));
        assert_eq!(s.gitlibs_dir, PathBuf::from("/work/.gitlibs"));
        assert_eq!(s.default_timeout, DEFAULT_TIMEOUT);
    }
}
