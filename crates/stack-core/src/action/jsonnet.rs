use super::{ActionCommon, Runnable};
use crate::error::{Result, StackError};
use crate::expr;
use crate::process::{self, StderrLog};
use crate::unit::Unit;
use crate::value;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonnetSource {
    Snippet(String),
    File(String),
}

/// `jsonnet:` rendering through the `jsonnet` binary. The context is passed
/// as the external variable `vars`.
#[derive(Debug)]
pub struct JsonnetAction {
    source: JsonnetSource,
}

impl JsonnetAction {
    pub fn parse(map: &Map<String, Value>) -> Result<Self> {
        let source = match map.get("jsonnet").unwrap_or(&Value::Null) {
            Value::String(s) => JsonnetSource::Snippet(s.clone()),
            Value::Array(items) if items.len() == 1 => {
                JsonnetSource::File(value::expect_str(&items[0], "jsonnet")?.to_string())
            }
            _ => {
                return Err(StackError::BadAction(
                    "jsonnet must be a snippet or a single-path list".to_string(),
                ))
            }
        };
        Ok(Self { source })
    }
}

fn jsonnet_bin() -> Result<PathBuf> {
    which::which("jsonnet").map_err(|_| StackError::ToolNotInstalled("jsonnet"))
}

impl Runnable for JsonnetAction {
    fn run(&self, unit: &Arc<Unit>, common: &ActionCommon) -> Result<Option<String>> {
        let ctx = common.context.resolve(unit)?;
        let mut cmd = Command::new(jsonnet_bin()?);
        cmd.arg("--ext-code").arg(format!("vars={}", serde_json::to_string(&ctx)?));
        match &self.source {
            JsonnetSource::Snippet(s) => {
                cmd.arg("--exec").arg(s);
            }
            JsonnetSource::File(raw) => {
                let rel = expr::compute_string(unit.runtime(), raw, &unit.view())
                    .unwrap_or_else(|| raw.clone());
                cmd.arg(crate::paths::absolutize(unit.workdir(), rel));
            }
        }
        let out = process::run_command(
            cmd,
            "jsonnet",
            unit.workdir(),
            common.run_timeout_or_default(unit),
            StderrLog::Warn,
        )?;
        if !out.status.success() {
            return Err(StackError::ToolFailed {
                tool: "jsonnet",
                reason: out.stderr.trim().to_string(),
            });
        }
        Ok(Some(out.stdout))
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
    fn snippet_or_single_path() {
        let a = JsonnetAction::parse(&m(json!({"jsonnet": "{a: std.extVar('vars').x}"}))).unwrap();
        assert!(matches!(a.source, JsonnetSource::Snippet(_)));
        let a = JsonnetAction::parse(&m(json!({"jsonnet": ["main.jsonnet"]}))).unwrap();
        assert_eq!(a.source, JsonnetSource::File("main.jsonnet".into()));
    }

    #[test]
    fn rejects_multiple_paths() {
        assert!(JsonnetAction::parse(&m(json!({"jsonnet": ["a", "b"]}))).is_err());
        assert!(JsonnetAction::parse(&m(json!({"jsonnet": {"a": 1}}))).is_err());
    }
}
