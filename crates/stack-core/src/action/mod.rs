//! Typed actions and their shared execution contract.
//!
//! A raw action declaration is a mapping; the first non-null discriminator key found
//! in [`DISCRIMINATORS`] order selects the kind. Every kind shares
//! [`ActionCommon`] (gates, timeouts, outputs, context) and runs through
//! [`Action::execute`].

pub mod gitclone;
pub mod group;
pub mod jsonnet;
pub mod script;
pub mod template;

use crate::error::{Result, StackError};
use crate::expr;
use crate::output::{self, OutputTarget};
use crate::unit::Unit;
use crate::value;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub use gitclone::GitCloneAction;
pub use group::GroupAction;
pub use jsonnet::JsonnetAction;
pub use script::ScriptAction;
pub use template::TemplateAction;

/// Dispatch precedence: the first non-null key wins.
pub const DISCRIMINATORS: [&str; 6] = ["gomplate", "pongo2", "jsonnet", "script", "gitclone", "group"];

const COMMON_KEYS: [&str; 6] = ["when", "wait", "runTimeout", "waitTimeout", "output", "vars"];
const EXTRA_KEYS: [&str; 4] = ["ref", "dir", "parallel", "name"];

/// One kind of work. Returned text, if any, goes through the action's outputs.
pub trait Runnable: Send + Sync {
    fn run(&self, unit: &Arc<Unit>, common: &ActionCommon) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// Common fields
// ---------------------------------------------------------------------------

/// Data handed to templates and scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum Context {
    /// The whole unit view.
    View,
    /// A dotted path into the view.
    Path(String),
    Inline(Map<String, Value>),
}

impl Context {
    fn parse(raw: Option<&Value>) -> Result<Self> {
        match raw {
            None | Some(Value::Null) => Ok(Context::View),
            Some(Value::String(path)) => Ok(Context::Path(path.clone())),
            Some(Value::Object(map)) => Ok(Context::Inline(map.clone())),
            Some(other) => Err(StackError::BadAction(format!(
                "'vars' must be a map or a path, found {}",
                value::type_name(other)
            ))),
        }
    }

    pub fn resolve(&self, unit: &Unit) -> Result<Value> {
        match self {
            Context::View => Ok(unit.view()),
            Context::Path(path) => value::get_path(&unit.view(), path)
                .cloned()
                .ok_or_else(|| StackError::PathNotFound {
                    path: path.clone(),
                    searched: "stack view".to_string(),
                }),
            Context::Inline(map) => Ok(Value::Object(map.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionCommon {
    pub when: String,
    pub wait: String,
    pub run_timeout: Option<Duration>,
    pub wait_timeout: Option<Duration>,
    pub outputs: Vec<OutputTarget>,
    pub context: Context,
}

impl ActionCommon {
    fn parse(map: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            when: optional_str(map, "when")?.unwrap_or_default(),
            wait: optional_str(map, "wait")?.unwrap_or_default(),
            run_timeout: optional_duration(map, "runTimeout")?,
            wait_timeout: optional_duration(map, "waitTimeout")?,
            outputs: OutputTarget::parse_list(map.get("output"))?,
            context: Context::parse(map.get("vars"))?,
        })
    }

    /// Run timeout, falling back to the runtime default.
    pub fn run_timeout_or_default(&self, unit: &Unit) -> Duration {
        self.run_timeout
            .unwrap_or(unit.runtime().settings().default_timeout)
    }
}

pub(crate) fn optional_str(map: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    map.get(key)
        .filter(|v| !v.is_null())
        .map(|v| value::expect_str(v, key).map(str::to_string))
        .transpose()
}

fn optional_duration(map: &Map<String, Value>, key: &str) -> Result<Option<Duration>> {
    optional_str(map, key)?
        .map(|s| {
            humantime::parse_duration(&s)
                .map_err(|e| StackError::BadAction(format!("{key} '{s}': {e}")))
        })
        .transpose()
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ActionKind {
    Template(TemplateAction),
    Jsonnet(JsonnetAction),
    Script(ScriptAction),
    GitClone(GitCloneAction),
    Group(GroupAction),
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Template(t) => t.engine(),
            ActionKind::Jsonnet(_) => "jsonnet",
            ActionKind::Script(_) => "script",
            ActionKind::GitClone(_) => "gitclone",
            ActionKind::Group(_) => "group",
        }
    }

    fn runnable(&self) -> &dyn Runnable {
        match self {
            ActionKind::Template(a) => a,
            ActionKind::Jsonnet(a) => a,
            ActionKind::Script(a) => a,
            ActionKind::GitClone(a) => a,
            ActionKind::Group(a) => a,
        }
    }
}

#[derive(Debug)]
pub struct Action {
    pub common: ActionCommon,
    pub kind: ActionKind,
}

impl Action {
    /// Parse one declaration. `Ok(None)` means it has no known discriminator
    /// and is dropped.
    pub fn parse(raw: &Value) -> Result<Option<Self>> {
        let Value::Object(map) = raw else {
            tracing::debug!(action = %raw, "dropping non-map action");
            return Ok(None);
        };
        let Some(key) = DISCRIMINATORS
            .iter()
            .copied()
            .find(|k| map.get(*k).is_some_and(|v| !v.is_null()))
        else {
            tracing::debug!(action = %raw, "dropping action without a known type");
            return Ok(None);
        };
        for k in map.keys() {
            let known = DISCRIMINATORS.contains(&k.as_str())
                || COMMON_KEYS.contains(&k.as_str())
                || EXTRA_KEYS.contains(&k.as_str());
            if !known {
                tracing::warn!(action = key, key = %k, "ignoring unknown action key");
            }
        }

        let common = ActionCommon::parse(map)?;
        let kind = match key {
            "gomplate" | "pongo2" => ActionKind::Template(TemplateAction::parse(key, map)?),
            "jsonnet" => ActionKind::Jsonnet(JsonnetAction::parse(map)?),
            "script" => ActionKind::Script(ScriptAction::parse(map)?),
            "gitclone" => ActionKind::GitClone(GitCloneAction::parse(map)?),
            _ => ActionKind::Group(GroupAction::parse(map)?),
        };
        Ok(Some(Self { common, kind }))
    }

    pub fn parse_list(raw: &[Value]) -> Result<Vec<Arc<Self>>> {
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            if let Some(action) = Self::parse(item)? {
                out.push(Arc::new(action));
            }
        }
        Ok(out)
    }

    /// Gate on `when`/`wait`, run, then route the produced text.
    pub fn execute(&self, unit: &Arc<Unit>) -> Result<()> {
        let rt = unit.runtime();
        if !expr::when(rt, &self.common.when, &unit.view()) {
            tracing::debug!(unit = %unit.workdir().display(), action = self.kind.name(), "skipped by when");
            return Ok(());
        }
        let wait_timeout = self.common.wait_timeout.unwrap_or(unit.wait_timeout());
        let viewer = Arc::clone(unit);
        expr::wait(rt, &self.common.wait, wait_timeout, unit.workdir(), move || {
            viewer.view()
        })?;

        tracing::info!(unit = %unit.workdir().display(), action = self.kind.name(), "running");
        let produced = self.kind.runnable().run(unit, &self.common)?;
        if let Some(text) = produced {
            output::route(unit, &self.common.outputs, &text)?;
        }
        Ok(())
    }

    /// Run on a dedicated thread. The handle always completes, whatever the
    /// action does.
    pub fn spawn(self: &Arc<Self>, unit: &Arc<Unit>) -> JoinHandle<Result<()>> {
        let action = Arc::clone(self);
        let unit = Arc::clone(unit);
        std::thread::spawn(move || action.execute(&unit))
    }
}

fn join(handle: JoinHandle<Result<()>>, what: &str) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(StackError::Panicked(what.to_string())))
}

/// Each action on its own thread, one at a time.
pub fn run_sequential(actions: &[Arc<Action>], unit: &Arc<Unit>) -> Result<()> {
    for action in actions {
        join(action.spawn(unit), action.kind.name())?;
    }
    Ok(())
}

/// All actions at once; waits for every one and returns the first error.
pub fn run_parallel(actions: &[Arc<Action>], unit: &Arc<Unit>) -> Result<()> {
    let handles: Vec<_> = actions
        .iter()
        .map(|a| (a.kind.name(), a.spawn(unit)))
        .collect();
    let mut first_err = None;
    for (name, handle) in handles {
        if let Err(e) = join(handle, name) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}
