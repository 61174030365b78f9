use super::{run_parallel, run_sequential, Action, ActionCommon, Runnable};
use crate::error::{Result, StackError};
use crate::process;
use crate::unit::Unit;
use crate::value;
use serde_json::{Map, Value};
use std::sync::Arc;

/// `group:` nested actions, run one at a time or all at once.
/// Without `runTimeout` the group is unbounded.
#[derive(Debug)]
pub struct GroupAction {
    actions: Vec<Arc<Action>>,
    parallel: bool,
}

impl GroupAction {
    pub fn parse(map: &Map<String, Value>) -> Result<Self> {
        let items = match map.get("group") {
            Some(v) => value::expect_list(v, "group")?,
            None => return Err(StackError::BadAction("group needs a list".to_string())),
        };
        let parallel = match map.get("parallel") {
            Some(v) => value::expect_bool(v, "parallel")?,
            None => false,
        };
        Ok(Self {
            actions: Action::parse_list(items)?,
            parallel,
        })
    }
}

impl Runnable for GroupAction {
    fn run(&self, unit: &Arc<Unit>, common: &ActionCommon) -> Result<Option<String>> {
        let actions = self.actions.clone();
        let parallel = self.parallel;
        let owner = Arc::clone(unit);
        let run = move || {
            if parallel {
                run_parallel(&actions, &owner)
            } else {
                run_sequential(&actions, &owner)
            }
        };
        match common.run_timeout {
            Some(timeout) => process::with_timeout("group", unit.workdir(), timeout, run)?,
            None => run()?,
        }
        Ok(None)
    }
}
