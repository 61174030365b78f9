use super::{optional_str, ActionCommon, Runnable};
use crate::error::{Result, StackError};
use crate::git;
use crate::paths;
use crate::unit::Unit;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_REF: &str = "master";

/// `gitclone:` fetch of a repository into the clone cache or `dir`.
#[derive(Debug)]
pub struct GitCloneAction {
    url: String,
    reference: String,
    dir: Option<String>,
}

impl GitCloneAction {
    pub fn parse(map: &Map<String, Value>) -> Result<Self> {
        let url = optional_str(map, "gitclone")?
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StackError::BadAction("gitclone needs a repository url".to_string()))?;
        Ok(Self {
            url,
            reference: optional_str(map, "ref")?.unwrap_or_else(|| DEFAULT_REF.to_string()),
            dir: optional_str(map, "dir")?,
        })
    }

    /// Explicit `dir` relative to the unit, else `<root>/.gitclone/<url>/<ref>`.
    pub fn target_dir(&self, unit: &Unit) -> PathBuf {
        match &self.dir {
            Some(dir) => paths::absolutize(unit.workdir(), dir),
            None => unit
                .runtime()
                .settings()
                .gitclone_dir()
                .join(paths::sanitize_component(&self.url))
                .join(paths::sanitize_component(&self.reference)),
        }
    }
}

impl Runnable for GitCloneAction {
    fn run(&self, unit: &Arc<Unit>, common: &ActionCommon) -> Result<Option<String>> {
        let dir = self.target_dir(unit);
        let timeout = common.run_timeout_or_default(unit);
        let result = unit.runtime().with_git_lock(&dir, || {
            git::sync_repo(&self.url, &self.reference, &dir, timeout)
        });
        match result {
            Ok(()) => {}
            Err(e @ StackError::Timeout { .. }) => return Err(e),
            Err(e) => {
                tracing::error!(unit = %unit.workdir().display(), repo = %self.url, "gitclone failed: {e}");
                unit.record_action_failure();
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults() {
        let a = GitCloneAction::parse(&m(json!({"gitclone": "https://h/r.git"}))).unwrap();
        assert_eq!(a.reference, "master");
        assert!(a.dir.is_none());
        let a = GitCloneAction::parse(&m(json!({"gitclone": "u", "ref": "v2", "dir": "vendor"})))
            .unwrap();
        assert_eq!(a.reference, "v2");
        assert_eq!(a.dir.as_deref(), Some("vendor"));
    }

    #[test]
    fn url_required() {
        assert!(GitCloneAction::parse(&m(json!({"gitclone": ""}))).is_err());
        assert!(GitCloneAction::parse(&m(json!({"gitclone": 1}))).is_err());
    }
}
