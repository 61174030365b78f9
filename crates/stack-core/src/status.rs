use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// Lifecycle label of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Loaded,
    PreRun,
    Run,
    ParseChildren,
    RunChildren,
    PostRun,
    Done,
    Skipped,
    Failed,
    Cancelled,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Loaded => "Loaded",
            UnitStatus::PreRun => "PreRun",
            UnitStatus::Run => "Run",
            UnitStatus::ParseChildren => "ParseChildren",
            UnitStatus::RunChildren => "RunChildren",
            UnitStatus::PostRun => "PostRun",
            UnitStatus::Done => "Done",
            UnitStatus::Skipped => "Skipped",
            UnitStatus::Failed => "Failed",
            UnitStatus::Cancelled => "Cancelled because app error",
        };
        f.write_str(s)
    }
}

/// Process-wide table of unit id to status.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    inner: Mutex<BTreeMap<String, UnitStatus>>,
}

impl StatusRegistry {
    pub fn set(&self, id: &str, status: UnitStatus) {
        self.lock().insert(id.to_string(), status);
    }

    pub fn get(&self, id: &str) -> Option<UnitStatus> {
        self.lock().get(id).copied()
    }

    /// Copy of the table with labels rendered as strings, as seen by views.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.to_string()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, UnitStatus>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_snapshot() {
        let reg = StatusRegistry::default();
        reg.set("stack_1", UnitStatus::Run);
        reg.set("stack_2", UnitStatus::Cancelled);
        reg.set("stack_1", UnitStatus::Done);
        assert_eq!(reg.get("stack_1"), Some(UnitStatus::Done));
        let snap = reg.snapshot();
        assert_eq!(snap["stack_1"], "Done");
        assert_eq!(snap["stack_2"], "Cancelled because app error");
        assert!(reg.get("stack_3").is_none());
    }
}
