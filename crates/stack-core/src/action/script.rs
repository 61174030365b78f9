use super::{ActionCommon, Runnable};
use crate::error::{Result, StackError};
use crate::io;
use crate::process::{self, StderrLog};
use crate::unit::Unit;
use serde_json::{Map, Value};
use std::process::Command;
use std::sync::Arc;

pub const ENV_VARS_FILE: &str = "STACK_VARS";
pub const ENV_ROOT: &str = "STACK_ROOT";
pub const ENV_GITCLONE_DIR: &str = "STACK_GITCLONE_DIR";

/// `script:` run with `sh -c` in the unit directory.
#[derive(Debug)]
pub struct ScriptAction {
    script: String,
}

impl ScriptAction {
    pub fn parse(map: &Map<String, Value>) -> Result<Self> {
        match map.get("script") {
            Some(Value::String(s)) => Ok(Self { script: s.clone() }),
            _ => Err(StackError::BadAction("script must be a string".to_string())),
        }
    }
}

impl Runnable for ScriptAction {
    fn run(&self, unit: &Arc<Unit>, common: &ActionCommon) -> Result<Option<String>> {
        let ctx = common.context.resolve(unit)?;
        let vars_file = io::write_temp_json(&ctx)?;
        let settings = unit.runtime().settings();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .env(ENV_VARS_FILE, vars_file.path())
            .env(ENV_ROOT, &settings.root)
            .env(ENV_GITCLONE_DIR, settings.gitclone_dir());
        let out = process::run_command(
            cmd,
            "script",
            unit.workdir(),
            common.run_timeout_or_default(unit),
            StderrLog::Warn,
        )?;

        if !out.status.success() {
            tracing::error!(
                unit = %unit.workdir().display(),
                script = %self.script,
                code = ?out.status.code(),
                "script failed"
            );
            unit.record_action_failure();
        }

        let stdout = out.stdout.strip_suffix('\n').unwrap_or(&out.stdout);
        if common.outputs.is_empty() && !stdout.is_empty() {
            tracing::debug!(unit = %unit.workdir().display(), "stdout: {stdout}");
        }
        Ok(Some(stdout.to_string()))
    }
}
