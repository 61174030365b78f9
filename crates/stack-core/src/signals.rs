//! Cross-unit synchronization: named wait-groups and the cancellation token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// How often blocked waiters re-check cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Wait-groups
// ---------------------------------------------------------------------------

/// Countdown barrier: open when no registrations are outstanding.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    open: Condvar,
}

impl WaitGroup {
    fn add(&self) {
        *lock(&self.count) += 1;
    }

    fn done(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.open.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *lock(&self.count)
    }

    /// Block until the group is open. Returns `false` if cancelled first.
    pub fn wait(&self, cancel: &CancelToken) -> bool {
        let mut count = lock(&self.count);
        while *count > 0 {
            if cancel.is_cancelled() {
                return false;
            }
            count = self
                .open
                .wait_timeout(count, CANCEL_CHECK_INTERVAL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}

/// One outstanding registration; released when dropped.
#[derive(Debug)]
pub struct SignalRegistration {
    name: String,
    group: Arc<WaitGroup>,
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        self.group.done();
        tracing::trace!(wait_group = %self.name, "released");
    }
}

/// Process-wide map of wait-group name to barrier. Groups are created lazily
/// on first registration and are never removed, so a released group stays open.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    groups: Mutex<HashMap<String, Arc<WaitGroup>>>,
}

impl SignalRegistry {
    pub fn register(&self, name: &str) -> SignalRegistration {
        let group = Arc::clone(
            lock(&self.groups)
                .entry(name.to_string())
                .or_insert_with(Default::default),
        );
        group.add();
        tracing::trace!(wait_group = %name, "registered");
        SignalRegistration {
            name: name.to_string(),
            group,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<WaitGroup>> {
        lock(&self.groups).get(name).cloned()
    }

    /// Outstanding registrations for `name`; zero for an unknown group.
    pub fn pending(&self, name: &str) -> usize {
        self.get(name).map_or(0, |g| g.pending())
    }

    /// `false` when no unit ever registered `name`, or on cancellation.
    /// Otherwise blocks until the group opens and returns `true`.
    pub fn wait(&self, name: &str, cancel: &CancelToken) -> bool {
        match self.get(name) {
            Some(group) => group.wait(cancel),
            None => false,
        }
    }
}
