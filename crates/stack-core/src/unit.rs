//! Units ("stacks"): loading the tree and driving the lifecycle.
//!
//! ```text
//! Loaded -> PreRun -> [when/wait] -> Run -> ParseChildren -> RunChildren -> PostRun -> Done|Failed
//!              |            \-> Skipped
//!              \-> Cancelled (at any phase boundary)
//! ```

use crate::action::{self, Action};
use crate::config::{self, UnitConfig, VarsSource};
use crate::error::{Result, StackError};
use crate::expr;
use crate::io;
use crate::libs;
use crate::paths;
use crate::runtime::Runtime;
use crate::signals::SignalRegistration;
use crate::status::UnitStatus;
use crate::value;
use crate::vars::{self, Vars};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Unit {
    id: String,
    api: String,
    name: String,
    workdir: PathBuf,
    parent: Weak<Unit>,
    runtime: Arc<Runtime>,
    libs: Vec<PathBuf>,
    pre_run: Vec<Arc<Action>>,
    run: Vec<Arc<Action>>,
    post_run: Vec<Arc<Action>>,
    stacks: Vec<Value>,
    pstacks: Vec<Value>,
    when: String,
    wait: String,
    wait_timeout: Duration,
    wait_groups: Vec<String>,
    vars: Mutex<Vars>,
    locals: Mutex<Map<String, Value>>,
    input: Mutex<Value>,
    failed: AtomicBool,
    children: Mutex<Vec<Arc<Unit>>>,
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("workdir", &self.workdir)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Unit {
    /// Load the unit file found in the runtime's root directory.
    pub fn load_root(rt: &Arc<Runtime>) -> Result<Arc<Self>> {
        let root = rt.settings().root.clone();
        let file = paths::find_stack_file(&root).map_err(|e| e.in_stack(vec![root.clone()]))?;
        Self::load_file(rt, &file, None)
    }

    /// Load a unit from its stack file. The unit directory is the file's directory.
    pub fn load_file(rt: &Arc<Runtime>, file: &Path, parent: Option<&Arc<Unit>>) -> Result<Arc<Self>> {
        let workdir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| rt.settings().root.clone());
        let workdir = paths::absolutize(&rt.settings().root, workdir);
        let trace = trace_from(parent, &workdir);
        tracing::info!(file = %file.display(), "reading stack");

        let config = UnitConfig::load(file).map_err(|e| e.in_stack(trace.clone()))?;
        let api = config
            .check_api(parent.map(|p| p.api.as_str()))
            .map_err(|e| e.in_stack(trace.clone()))?;
        let name = workdir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::build(rt, config, api, name, workdir, parent).map_err(|e| e.in_stack(trace))
    }

    /// Load a unit declared inline in a parent's `stacks`. It shares the
    /// parent's directory and inherits its api.
    pub fn load_inline(rt: &Arc<Runtime>, raw: &Value, parent: &Arc<Unit>) -> Result<Arc<Self>> {
        let workdir = parent.workdir.clone();
        let trace = trace_from(Some(parent), &workdir);
        let build = || {
            let config = UnitConfig::from_value(raw.clone(), &workdir)?;
            let api = config.check_api(Some(&parent.api))?;
            let name = config.name.clone().unwrap_or_default();
            Self::build(rt, config, api, name, workdir.clone(), Some(parent))
        };
        build().map_err(|e| e.in_stack(trace))
    }

    fn build(
        rt: &Arc<Runtime>,
        config: UnitConfig,
        api: String,
        name: String,
        workdir: PathBuf,
        parent: Option<&Arc<Unit>>,
    ) -> Result<Arc<Self>> {
        let settings = rt.settings();

        // varsFrom sources are defaults: each one goes on the left, so the
        // unit's own keys and earlier sources win unless the source uses `+`.
        let mut own = Vars::parse(&config.vars)?;
        for source in &config.vars_from {
            let raw = match source {
                VarsSource::File(p) => io::read_map(&paths::absolutize(&workdir, p))?,
                VarsSource::Sops(p) => io::read_sops_map(&paths::absolutize(&workdir, p))?,
            };
            own = vars::merge(Vars::parse(&raw)?, own);
        }
        // CLI files and --set values are overrides and go on the right.
        if parent.is_none() {
            for file in &settings.var_files {
                let raw = io::read_map(&paths::absolutize(&settings.root, file))?;
                own = vars::merge(own, Vars::parse(&raw)?);
            }
            if !settings.set_values.is_empty() {
                let raw = io::parse_set_values(&settings.set_values)?;
                own = vars::merge(own, Vars::parse(&raw)?);
            }
        }
        let combined = match parent {
            Some(p) => vars::merge(p.vars_snapshot(), own),
            None => own,
        };

        rt.with_flags(|flags| value::merge_missing(flags, config.flags.clone()));

        let lib_items = config.libs.as_ref().map(|l| l.items()).unwrap_or_default();
        let libs = libs::resolve(rt, &workdir, &lib_items)?;

        let unit = Arc::new(Self {
            id: rt.next_unit_id(),
            api,
            name,
            workdir,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            runtime: Arc::clone(rt),
            libs,
            pre_run: Action::parse_list(&config.pre_run)?,
            run: Action::parse_list(&config.run)?,
            post_run: Action::parse_list(&config.post_run)?,
            stacks: config.stacks,
            pstacks: config.pstacks,
            when: config.when,
            wait: config.wait,
            wait_timeout: config.wait_timeout.unwrap_or(settings.default_timeout),
            wait_groups: config.wait_groups,
            vars: Mutex::new(combined),
            locals: Mutex::new(config.locals),
            input: Mutex::new(Value::Null),
            failed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        });
        unit.set_status(UnitStatus::Loaded);
        tracing::debug!(id = %unit.id, name = %unit.name, workdir = %unit.workdir.display(), "loaded");
        Ok(unit)
    }
}

fn trace_from(parent: Option<&Arc<Unit>>, workdir: &Path) -> Vec<PathBuf> {
    let mut trace = vec![workdir.to_path_buf()];
    if let Some(p) = parent {
        trace.extend(p.trace());
    }
    trace
}

// ---------------------------------------------------------------------------
// Accessors and state
// ---------------------------------------------------------------------------

impl Unit {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn parent(&self) -> Option<Arc<Unit>> {
        self.parent.upgrade()
    }

    pub fn libs(&self) -> &[PathBuf] {
        &self.libs
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn status(&self) -> Option<UnitStatus> {
        self.runtime.status().get(&self.id)
    }

    fn set_status(&self, status: UnitStatus) {
        self.runtime.status().set(&self.id, status);
    }

    pub fn children(&self) -> Vec<Arc<Unit>> {
        lock(&self.children).clone()
    }

    pub fn vars_snapshot(&self) -> Vars {
        lock(&self.vars).clone()
    }

    pub fn vars_value(&self) -> Value {
        lock(&self.vars).to_value()
    }

    /// Merge `update` on the right of the current variables.
    pub fn add_vars_right(&self, update: &Map<String, Value>) -> Result<()> {
        let parsed = Vars::parse(update)?;
        let mut current = lock(&self.vars);
        let previous = std::mem::take(&mut *current);
        *current = vars::merge(previous, parsed);
        Ok(())
    }

    pub fn locals(&self) -> Map<String, Value> {
        lock(&self.locals).clone()
    }

    pub fn with_locals<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut lock(&self.locals))
    }

    pub fn input(&self) -> Value {
        lock(&self.input).clone()
    }

    pub fn set_input(&self, input: Value) {
        *lock(&self.input) = input;
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// This unit's directory followed by every ancestor's.
    pub fn trace(&self) -> Vec<PathBuf> {
        let mut out = vec![self.workdir.clone()];
        let mut cur = self.parent();
        while let Some(unit) = cur {
            out.push(unit.workdir.clone());
            cur = unit.parent();
        }
        out
    }

    /// A local action failure: keep going, but finish `Failed` and make the
    /// process exit non-zero.
    pub fn record_action_failure(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.runtime.record_action_failure();
        let trace = paths::display_list(&self.trace());
        tracing::error!(unit = %self.workdir.display(), trace = %trace, "action failed");
    }

    /// Read-only snapshot used by expressions, templates and scripts.
    pub fn view(&self) -> Value {
        let mut view = json!({
            "api": self.api,
            "id": self.id,
            "name": self.name,
            "workdir": self.workdir.display().to_string(),
            "input": self.input(),
            "vars": self.vars_value(),
            "flags": Value::Object(self.runtime.flags()),
            "locals": Value::Object(self.locals()),
            "status": self.runtime.status().snapshot(),
        });
        let this = view.clone();
        view["stack"] = this;
        view
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

impl Unit {
    /// Drive the unit and its children to a terminal status.
    ///
    /// Cancellation is not an error: the unit ends `Cancelled` and returns
    /// `Ok`. Any other error aborts the runtime and carries the unit trace.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        match self.lifecycle() {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                tracing::info!(unit = %self.workdir.display(), "cancelled");
                self.set_status(UnitStatus::Cancelled);
                Ok(())
            }
            Err(e) => {
                self.set_status(UnitStatus::Failed);
                self.runtime.abort();
                Err(e.in_stack(self.trace()))
            }
        }
    }

    fn lifecycle(self: &Arc<Self>) -> Result<()> {
        // Dropped on every exit path below, which releases the wait-groups.
        let _registrations = self.register_wait_groups();

        self.check_cancelled()?;
        self.enter(UnitStatus::PreRun);
        action::run_sequential(&self.pre_run, self)?;

        self.check_cancelled()?;
        if !expr::when(&self.runtime, &self.when, &self.view()) {
            tracing::info!(unit = %self.workdir.display(), when = %self.when, "skipped");
            self.set_status(UnitStatus::Skipped);
            return Ok(());
        }
        let viewer = Arc::clone(self);
        expr::wait(&self.runtime, &self.wait, self.wait_timeout, &self.workdir, move || {
            viewer.view()
        })?;

        self.enter(UnitStatus::Run);
        action::run_sequential(&self.run, self)?;
        self.check_cancelled()?;

        self.enter(UnitStatus::ParseChildren);
        let sequential = self.parse_children(&self.stacks)?;
        let parallel = self.parse_children(&self.pstacks)?;
        lock(&self.children).extend(sequential.iter().chain(&parallel).cloned());

        self.enter(UnitStatus::RunChildren);
        for child in &sequential {
            child.start()?;
        }
        start_parallel(&parallel)?;

        self.check_cancelled()?;
        self.enter(UnitStatus::PostRun);
        action::run_sequential(&self.post_run, self)?;
        self.check_cancelled()?;

        self.set_status(if self.is_failed() {
            UnitStatus::Failed
        } else {
            UnitStatus::Done
        });
        Ok(())
    }

    fn enter(&self, status: UnitStatus) {
        tracing::info!(unit = %self.workdir.display(), "{status}");
        self.set_status(status);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.runtime.is_cancelled() {
            return Err(StackError::Cancelled);
        }
        Ok(())
    }

    /// Names may be expressions; a string result replaces the literal name.
    fn register_wait_groups(&self) -> Vec<SignalRegistration> {
        if self.wait_groups.is_empty() {
            return Vec::new();
        }
        let view = self.view();
        self.wait_groups
            .iter()
            .map(|raw| {
                let name = expr::compute_string(&self.runtime, raw, &view).unwrap_or_else(|| raw.clone());
                self.runtime.signals().register(&name)
            })
            .collect()
    }
}

fn start_parallel(children: &[Arc<Unit>]) -> Result<()> {
    let handles: Vec<_> = children
        .iter()
        .map(|child| {
            let child = Arc::clone(child);
            let name = child.workdir.display().to_string();
            (name, std::thread::spawn(move || child.start()))
        })
        .collect();
    let mut first_err = None;
    for (name, handle) in handles {
        let result = handle
            .join()
            .unwrap_or_else(|_| Err(StackError::Panicked(format!("stack {name}"))));
        if let Err(e) = result {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

// ---------------------------------------------------------------------------
// Child declarations
// ---------------------------------------------------------------------------

impl Unit {
    fn parse_children(self: &Arc<Self>, decls: &[Value]) -> Result<Vec<Arc<Unit>>> {
        let mut out = Vec::new();
        for decl in decls {
            self.parse_child(decl, Path::new(""), &mut out)?;
        }
        Ok(out)
    }

    fn parse_child(self: &Arc<Self>, decl: &Value, prefix: &Path, out: &mut Vec<Arc<Unit>>) -> Result<()> {
        match decl {
            Value::String(pattern) => {
                for dir in self.find_child_dirs(prefix, pattern)? {
                    out.push(self.load_child(&dir)?);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.parse_child(item, prefix, out)?;
                }
            }
            Value::Object(map) if config::is_inline_unit(map) => {
                out.push(Unit::load_inline(&self.runtime, decl, self)?);
            }
            Value::Object(map) if !map.is_empty() && map.values().all(Value::is_string) => {
                let view = self.view();
                for (pattern, bound) in map {
                    let bound = bound.as_str().unwrap_or_default();
                    let computed = expr::compute_string(&self.runtime, bound, &view)
                        .unwrap_or_else(|| bound.to_string());
                    let input = value::get_path(&view, &computed)
                        .cloned()
                        .unwrap_or(Value::String(computed));
                    for dir in self.find_child_dirs(prefix, pattern)? {
                        let child = self.load_child(&dir)?;
                        child.set_input(input.clone());
                        out.push(child);
                    }
                }
            }
            Value::Object(map) => {
                for (sub, nested) in map {
                    self.parse_child(nested, &prefix.join(sub), out)?;
                }
            }
            other => {
                return Err(StackError::BadConfig {
                    path: self.workdir.clone(),
                    reason: format!("bad stacks item {other}"),
                })
            }
        }
        Ok(())
    }

    fn load_child(self: &Arc<Self>, dir: &Path) -> Result<Arc<Unit>> {
        let file = paths::find_stack_file(dir)?;
        Unit::load_file(&self.runtime, &file, Some(self))
    }

    /// First library whose `prefix` directory has matches wins.
    fn find_child_dirs(&self, prefix: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        for lib in &self.libs {
            let found = paths::matching_stack_dirs(&lib.join(prefix), pattern)?;
            if !found.is_empty() {
                return Ok(found);
            }
        }
        Err(StackError::PatternNotFound {
            pattern: prefix.join(pattern).display().to_string(),
            searched: paths::display_list(&self.libs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Settings, EXIT_ACTION_FAILED, EXIT_FATAL, EXIT_INTERRUPTED};
    use std::time::Instant;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn runtime(root: &Path) -> Arc<Runtime> {
        Runtime::capturing(Settings::new(root))
    }

    fn run_root(rt: &Arc<Runtime>) -> Result<Arc<Unit>> {
        let unit = Unit::load_root(rt)?;
        unit.start()?;
        Ok(unit)
    }

    #[test]
    fn root_vars_merge_files_and_set_values() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nvars:\n  a: 1\n  keep+: 1\n  b: x\nvarsFrom:\n  - file: extra.yaml\n",
        );
        write(dir.path(), "extra.yaml", "b: y\nc: [1]\n");
        write(dir.path(), "cli.yaml", "c: [2]\n");
        let mut settings = Settings::new(dir.path());
        settings.var_files = vec![PathBuf::from("cli.yaml")];
        settings.set_values = vec!["a=2,keep=2".to_string()];
        let rt = Runtime::capturing(settings);

        let unit = Unit::load_root(&rt).unwrap();
        assert_eq!(unit.id(), "stack_1");
        assert_eq!(unit.vars_value(), json!({"a": 2, "keep": 1, "b": "x", "c": [2]}));
        assert_eq!(unit.status(), Some(UnitStatus::Loaded));
        assert_eq!(unit.name(), dir.path().file_name().unwrap().to_string_lossy());
    }

    #[test]
    fn vars_from_files_are_defaults() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "vars:\n  a: 1\n  forced: 1\n  list: [own]\n",
                "varsFrom:\n  - file: first.yaml\n  - file: second.yaml\n",
            ),
        );
        write(dir.path(), "first.yaml", "a: 2\nforced+: 2\nlist+: [file]\nonly: first\n");
        write(dir.path(), "second.yaml", "only: second\nextra: 3\n");
        let mut settings = Settings::new(dir.path());
        settings.set_values = vec!["b=cli".to_string()];
        let rt = Runtime::capturing(settings);

        let unit = Unit::load_root(&rt).unwrap();
        assert_eq!(
            unit.vars_value(),
            json!({
                "a": 1,
                "forced": 2,
                "list": ["file", "own"],
                "only": "first",
                "extra": 3,
                "b": "cli"
            })
        );
    }

    #[test]
    fn children_inherit_and_override_vars() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nvars:\n  a: 1\n  l+: [1]\n  only: parent\nstacks:\n  - child\n",
        );
        write(
            dir.path(),
            "child/stack.yaml",
            "api: v1\nvars:\n  a: 2\n  l: [2]\nrun:\n  - gomplate: \"{{ vars | toJson }}\"\n    output:\n      - stdout\n",
        );
        let rt = runtime(dir.path());
        let root = run_root(&rt).unwrap();

        let child = &root.children()[0];
        assert_eq!(child.name(), "child");
        assert_eq!(child.parent().unwrap().id(), root.id());
        assert_eq!(child.vars_value(), json!({"a": 2, "l": [1, 2], "only": "parent"}));
        let printed: Value = serde_json::from_str(rt.stdout().captured().trim()).unwrap();
        assert_eq!(printed, json!({"a": 2, "l": [1, 2], "only": "parent"}));
    }

    #[test]
    fn parallel_children_finish_before_post_run() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "pstacks:\n  - c-.*\n",
                "postRun:\n",
                "  - gomplate: \"{{ status | toJson }}\"\n",
                "    output:\n      - yml2var: vars.snapshot\n",
            ),
        );
        for (name, sleep) in [("c-1", "0.5"), ("c-2", "0.3"), ("c-3", "0.4")] {
            write(
                dir.path(),
                &format!("{name}/stack.yaml"),
                &format!("api: v1\nrun:\n  - script: sleep {sleep}\n"),
            );
        }
        let rt = runtime(dir.path());
        let started = Instant::now();
        let root = run_root(&rt).unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));

        let snapshot = root.vars_value()["snapshot"].clone();
        let children = root.children();
        assert_eq!(children.len(), 3);
        for child in children {
            assert_eq!(snapshot[child.id()], json!("Done"), "{}", child.name());
        }
        assert_eq!(snapshot[root.id()], json!("PostRun"));
        assert_eq!(root.status(), Some(UnitStatus::Done));
    }

    #[test]
    fn failed_when_still_releases_wait_group() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "pstacks:\n",
                "  - name: producer\n",
                "    waitGroups: [db]\n",
                "    when: \"false\"\n",
                "    preRun:\n      - script: sleep 0.3\n",
                "    run:\n      - script: echo never\n        output: [stdout]\n",
                "  - name: consumer\n",
                "    wait: \"waitGroup('db')\"\n",
                "    waitTimeout: 5s\n",
                "    run:\n      - script: echo consumed\n        output: [stdout]\n",
            ),
        );
        let rt = runtime(dir.path());
        let root = run_root(&rt).unwrap();
        assert_eq!(rt.stdout().captured(), "consumed\n");
        let statuses: Vec<_> = root.children().iter().map(|c| c.status()).collect();
        assert_eq!(statuses, vec![Some(UnitStatus::Skipped), Some(UnitStatus::Done)]);
        assert_eq!(rt.exit_code(), 0);
    }

    #[test]
    fn wait_group_names_can_be_expressions() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "vars:\n  env: prod\n",
                "pstacks:\n",
                "  - name: a\n",
                "    waitGroups: [\"'db-' ~ vars.env\"]\n",
                "    run:\n      - script: sleep 0.2\n",
                "  - name: b\n",
                "    wait: \"waitGroup('db-prod')\"\n",
                "    waitTimeout: 5s\n",
                "    run:\n      - script: echo ok\n        output: [stdout]\n",
            ),
        );
        let rt = runtime(dir.path());
        run_root(&rt).unwrap();
        assert_eq!(rt.stdout().captured(), "ok\n");
    }

    #[test]
    fn wait_timeout_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nwait: \"false\"\nwaitTimeout: 200ms\nrun:\n  - script: echo never\n    output: [stdout]\n",
        );
        let rt = runtime(dir.path());
        let started = Instant::now();
        let err = run_root(&rt).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(err.to_string().contains("not satisfied"), "{err}");
        assert!(err.to_string().contains(&dir.path().display().to_string()));
        assert_eq!(rt.exit_code(), EXIT_FATAL);
        assert!(rt.stdout().captured().is_empty());
    }

    #[test]
    fn outputs_feed_later_actions_and_other_units() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "run:\n",
                "  - script: \"echo 'x: 1'\"\n",
                "    output:\n      - yml2var: vars\n",
                "  - script: echo saw-x\n",
                "    when: vars.x == 1\n",
                "    output: [stdout]\n",
                "stacks:\n",
                "  - name: writer\n",
                "    run:\n      - script: printf hello\n        output:\n          - str2var: flags.greeting\n",
                "  - name: reader\n",
                "    run:\n      - script: echo flag-seen\n        when: flags.greeting == 'hello'\n        output: [stdout]\n",
            ),
        );
        let rt = runtime(dir.path());
        let root = run_root(&rt).unwrap();
        assert_eq!(rt.stdout().captured(), "saw-x\nflag-seen\n");
        assert_eq!(root.vars_value()["x"], json!(1));
        assert_eq!(rt.flags()["greeting"], json!("hello"));
    }

    #[test]
    fn locals_output_stays_in_unit() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "locals:\n  keep: 1\n",
                "run:\n",
                "  - gomplate: \"{a: {b: 2}}\"\n",
                "    output:\n      - yml2var: locals.out\n",
            ),
        );
        let rt = runtime(dir.path());
        let root = run_root(&rt).unwrap();
        assert_eq!(Value::Object(root.locals()), json!({"keep": 1, "out": {"a": {"b": 2}}}));
    }

    #[test]
    fn script_failure_is_contained() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "run:\n",
                "  - script: exit 4\n",
                "  - script: echo still-running\n",
                "    output: [stdout]\n",
                "stacks:\n",
                "  - name: sibling\n",
                "    run:\n      - script: echo sibling\n        output: [stdout]\n",
            ),
        );
        let rt = runtime(dir.path());
        let root = run_root(&rt).unwrap();
        assert_eq!(rt.stdout().captured(), "still-running\nsibling\n");
        assert_eq!(root.status(), Some(UnitStatus::Failed));
        assert!(root.is_failed());
        assert_eq!(root.children()[0].status(), Some(UnitStatus::Done));
        assert_eq!(rt.exit_code(), EXIT_ACTION_FAILED);
    }

    #[test]
    fn script_sees_environment_contract() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "vars:\n  app: {port: 8080}\n",
                "run:\n",
                "  - script: cat \"$STACK_VARS\"; echo; echo \"$STACK_ROOT\"; echo \"$STACK_GITCLONE_DIR\"\n",
                "    vars: vars.app\n",
                "    output: [stdout]\n",
            ),
        );
        let rt = runtime(dir.path());
        run_root(&rt).unwrap();
        let out = rt.stdout().captured();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(serde_json::from_str::<Value>(lines[0]).unwrap(), json!({"port": 8080}));
        assert_eq!(lines[1], dir.path().display().to_string());
        assert_eq!(lines[2], dir.path().join(".gitclone").display().to_string());
    }

    #[test]
    fn parametrized_children_get_input() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nvars:\n  svc: {port: 81}\nstacks:\n  - svc-.*: vars.svc\n  - name-.*: \"'lit' ~ 'eral'\"\n",
        );
        let child = "api: v1\nrun:\n  - gomplate: \"{{ input | toJson }}\"\n    output: [stdout]\n";
        write(dir.path(), "svc-a/stack.yaml", child);
        write(dir.path(), "name-a/stack.yaml", child);
        let rt = runtime(dir.path());
        let root = run_root(&rt).unwrap();
        assert_eq!(root.children()[0].input(), json!({"port": 81}));
        assert_eq!(root.children()[1].input(), json!("literal"));
        assert_eq!(rt.stdout().captured(), "{\"port\":81}\n\"literal\"\n");
    }

    #[test]
    fn prefix_maps_and_libs_resolve_children() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nlibs: [shared]\nstacks:\n  - group:\n      - app\n  - tool\n",
        );
        write(dir.path(), "group/app/stack.yaml", "api: v1\n");
        write(dir.path(), "shared/tool/stack.yml", "api: v1\n");
        let rt = runtime(dir.path());
        let root = run_root(&rt).unwrap();
        let names: Vec<_> = root.children().iter().map(|c| c.workdir().to_path_buf()).collect();
        assert_eq!(
            names,
            vec![dir.path().join("group/app"), dir.path().join("shared/tool")]
        );
        assert_eq!(
            root.libs(),
            &[dir.path().to_path_buf(), dir.path().join("shared")]
        );
    }

    #[test]
    fn unknown_pattern_is_fatal_with_trace() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "stack.yaml", "api: v1\nstacks:\n  - mid\n");
        write(dir.path(), "mid/stack.yaml", "api: v1\nstacks:\n  - missing-.*\n");
        let rt = runtime(dir.path());
        let err = run_root(&rt).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no stacks match 'missing-.*'"), "{msg}");
        assert!(msg.contains(&dir.path().join("mid").display().to_string()), "{msg}");
        assert_eq!(rt.exit_code(), EXIT_FATAL);
    }

    #[test]
    fn bad_var_suffix_in_child_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "stack.yaml", "api: v1\nstacks:\n  - child\n");
        write(dir.path(), "child/stack.yaml", "api: v1\nvars:\n  a+-: 1\n");
        let rt = runtime(dir.path());
        let err = run_root(&rt).unwrap_err();
        assert!(err.to_string().contains("bad var name 'a+-'"));
    }

    #[test]
    fn interrupted_run_is_cancelled() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nwaitGroups: [root]\nrun:\n  - script: echo never\n    output: [stdout]\n",
        );
        let rt = runtime(dir.path());
        let root = Unit::load_root(&rt).unwrap();
        rt.interrupt();
        root.start().unwrap();
        assert_eq!(root.status(), Some(UnitStatus::Cancelled));
        assert!(rt.stdout().captured().is_empty());
        assert_eq!(rt.exit_code(), EXIT_INTERRUPTED);
        assert!(rt.signals().get("root").is_some());
        assert_eq!(rt.signals().pending("root"), 0);
    }

    #[test]
    fn flags_from_config_do_not_overwrite() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nflags:\n  mode: first\nstacks:\n  - name: c\n    flags:\n      mode: second\n      extra: 1\n",
        );
        let rt = runtime(dir.path());
        run_root(&rt).unwrap();
        assert_eq!(Value::Object(rt.flags()), json!({"mode": "first", "extra": 1}));
    }

    #[test]
    fn group_actions_run_in_parallel() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            concat!(
                "api: v1\n",
                "run:\n",
                "  - group:\n",
                "      - script: sleep 0.4\n",
                "      - script: sleep 0.4\n",
                "      - script: sleep 0.4\n",
                "    parallel: true\n",
            ),
        );
        let rt = runtime(dir.path());
        let started = Instant::now();
        run_root(&rt).unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn group_run_timeout_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "stack.yaml",
            "api: v1\nrun:\n  - group:\n      - script: sleep 2\n    runTimeout: 200ms\n",
        );
        let rt = runtime(dir.path());
        let err = run_root(&rt).unwrap_err();
        assert!(err.to_string().contains("group timed out"), "{err}");
    }
}
