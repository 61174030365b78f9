//! Condition evaluation against unit views.
//!
//! Expressions use the minijinja expression syntax (`vars.env == "prod" and
//! waitGroup("db")`). The view of the unit is the evaluation context and is
//! also reachable as `stack`, so `stack.vars.env` and `vars.env` are the same.

use crate::error::{Result, StackError};
use crate::runtime::Runtime;
use crate::signals::{CancelToken, SignalRegistry};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &str, view: &Value) -> Result<Value>;
}

pub struct JinjaEvaluator {
    env: minijinja::Environment<'static>,
}

impl JinjaEvaluator {
    pub fn new(signals: Arc<SignalRegistry>, cancel: CancelToken) -> Self {
        let mut env = minijinja::Environment::new();
        env.add_function("waitGroup", move |name: String| -> bool {
            signals.wait(&name, &cancel)
        });
        Self { env }
    }
}

impl Evaluator for JinjaEvaluator {
    fn evaluate(&self, expr: &str, view: &Value) -> Result<Value> {
        let failed = |e: minijinja::Error| StackError::Expression {
            expr: expr.to_string(),
            reason: e.to_string(),
        };
        let compiled = self.env.compile_expression(expr).map_err(failed)?;
        let result = compiled.eval(view).map_err(failed)?;
        Ok(serde_json::to_value(&result)?)
    }
}

/// Gate for units and actions. An empty expression passes; anything that is
/// not a boolean `true` fails.
pub fn when(rt: &Runtime, expr: &str, view: &Value) -> bool {
    if expr.trim().is_empty() {
        return true;
    }
    match rt.evaluator().evaluate(expr, view) {
        Ok(Value::Bool(b)) => b,
        Ok(other) => {
            tracing::warn!(expr, result = %other, "when expression is not a boolean");
            false
        }
        Err(e) => {
            tracing::debug!("{e}");
            false
        }
    }
}

/// Poll `expr` every [`WAIT_POLL_INTERVAL`] until it is `true`.
///
/// Returns [`StackError::WaitTimeout`] when `timeout` elapses first, even if
/// the expression is blocked inside `waitGroup`. Evaluation errors count as
/// "not yet".
pub fn wait<F>(rt: &Arc<Runtime>, expr: &str, timeout: Duration, workdir: &Path, view: F) -> Result<()>
where
    F: Fn() -> Value + Send + 'static,
{
    if expr.trim().is_empty() {
        return Ok(());
    }
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    {
        let rt = Arc::clone(rt);
        let stop = Arc::clone(&stop);
        let expr = expr.to_string();
        std::thread::spawn(move || loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            if rt.is_cancelled() {
                let _ = tx.send(Err(StackError::Cancelled));
                return;
            }
            match rt.evaluator().evaluate(&expr, &view()) {
                Ok(Value::Bool(true)) => {
                    let _ = tx.send(Ok(()));
                    return;
                }
                Ok(other) => tracing::trace!(expr = %expr, result = %other, "waiting"),
                Err(e) => tracing::trace!("waiting: {e}"),
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        });
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            stop.store(true, Ordering::SeqCst);
            Err(StackError::WaitTimeout {
                expr: expr.to_string(),
                workdir: workdir.to_path_buf(),
                timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(StackError::Panicked(format!("wait '{expr}'"))),
    }
}

/// Evaluate `expr` and return it only when the result is a string.
pub fn compute_string(rt: &Runtime, expr: &str, view: &Value) -> Option<String> {
    match rt.evaluator().evaluate(expr, view) {
        Ok(Value::String(s)) => Some(s),
        Ok(_) => None,
        Err(e) => {
            tracing::trace!("{e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Settings;
    use serde_json::json;
    use std::time::Instant;

    fn rt() -> Arc<Runtime> {
        Runtime::capturing(Settings::new("/tmp"))
    }

    fn view() -> Value {
        let mut v = json!({"name": "app", "vars": {"env": "prod", "n": 3}, "flags": {}});
        let copy = v.clone();
        v["stack"] = copy;
        v
    }

    #[test]
    fn when_empty_is_true() {
        assert!(when(&rt(), "", &view()));
        assert!(when(&rt(), "  ", &view()));
    }

    #[test]
    fn when_reads_view() {
        let rt = rt();
        assert!(when(&rt, "vars.env == 'prod'", &view()));
        assert!(when(&rt, "stack.vars.n > 2 and name == 'app'", &view()));
        assert!(!when(&rt, "vars.env == 'dev'", &view()));
    }

    #[test]
    fn when_non_bool_or_error_is_false() {
        let rt = rt();
        assert!(!when(&rt, "vars.env", &view()));
        assert!(!when(&rt, "vars.n +", &view()));
    }

    #[test]
    fn compute_string_only_for_strings() {
        let rt = rt();
        assert_eq!(compute_string(&rt, "vars.env", &view()), Some("prod".into()));
        assert_eq!(compute_string(&rt, "'db-' ~ vars.env", &view()), Some("db-prod".into()));
        assert_eq!(compute_string(&rt, "vars.n", &view()), None);
        assert_eq!(compute_string(&rt, "plain-name", &view()), None);
    }

    #[test]
    fn wait_group_unknown_is_false() {
        let rt = rt();
        assert!(!when(&rt, "waitGroup('nobody')", &view()));
    }

    #[test]
    fn wait_group_released_is_true() {
        let rt = rt();
        drop(rt.signals().register("db"));
        assert!(when(&rt, "waitGroup('db')", &view()));
    }

    #[test]
    fn wait_succeeds_once_condition_holds() {
        let rt = rt();
        let reg = rt.signals().register("late");
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            drop(reg);
        });
        wait(&rt, "waitGroup('late')", Duration::from_secs(5), Path::new("/"), view).unwrap();
    }

    #[test]
    fn wait_times_out_even_when_blocked() {
        let rt = rt();
        let _held = rt.signals().register("never");
        let started = Instant::now();
        let err = wait(
            &rt,
            "waitGroup('never')",
            Duration::from_millis(200),
            Path::new("/w"),
            view,
        )
        .unwrap_err();
        assert!(matches!(err, StackError::WaitTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        rt.abort();
    }

    #[test]
    fn wait_observes_cancellation() {
        let rt = rt();
        rt.abort();
        let err = wait(&rt, "false", Duration::from_secs(5), Path::new("/"), view).unwrap_err();
        assert!(err.is_cancelled());
    }
}
