use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("bad var name '{raw}': {reason}")]
    BadVarName { raw: String, reason: String },

    #[error("var '{0}' is defined more than once")]
    VarDoubleDefinition(String),

    #[error("unsupported api '{0}': only v1 is supported")]
    UnsupportedApi(String),

    #[error("invalid stack config {path}: {reason}")]
    BadConfig { path: PathBuf, reason: String },

    #[error("no stack file found in {0}")]
    StackFileNotFound(PathBuf),

    #[error("no stacks match '{pattern}' in any of: {searched}")]
    PatternNotFound { pattern: String, searched: String },

    #[error("invalid stack pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("path '{path}' not found in any of: {searched}")]
    PathNotFound { path: String, searched: String },

    #[error("invalid lib '{0}'")]
    BadLib(String),

    #[error("invalid output target: {0}")]
    BadOutput(String),

    #[error("invalid action: {0}")]
    BadAction(String),

    #[error("invalid --set value '{0}': expected key=value")]
    BadSetValue(String),

    #[error("expected {expected} at '{path}', found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("expression '{expr}' failed: {reason}")]
    Expression { expr: String, reason: String },

    #[error("template render failed: {0}")]
    Template(#[from] minijinja::Error),

    #[error("{what} timed out after {} in {}", humantime::format_duration(*timeout), workdir.display())]
    Timeout {
        what: String,
        workdir: PathBuf,
        timeout: Duration,
    },

    #[error("wait '{expr}' not satisfied after {} in {}", humantime::format_duration(*timeout), workdir.display())]
    WaitTimeout {
        expr: String,
        workdir: PathBuf,
        timeout: Duration,
    },

    #[error("{0} is not installed or not on PATH")]
    ToolNotInstalled(&'static str),

    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: &'static str, reason: String },

    #[error("{0} panicked")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{source}\n  stack trace:\n{}", format_trace(trace))]
    InStack {
        trace: Vec<PathBuf>,
        #[source]
        source: Box<StackError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StackError {
    /// Attach the ancestor working-directory chain unless one is already attached.
    pub fn in_stack(self, trace: Vec<PathBuf>) -> Self {
        match self {
            e @ StackError::InStack { .. } => e,
            StackError::Cancelled => StackError::Cancelled,
            e => StackError::InStack {
                trace,
                source: Box::new(e),
            },
        }
    }

    /// True when the error only reports that cancellation was observed.
    pub fn is_cancelled(&self) -> bool {
        match self {
            StackError::Cancelled => true,
            StackError::InStack { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

fn format_trace(trace: &[PathBuf]) -> String {
    trace
        .iter()
        .map(|p| format!("    {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, StackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_stack_wraps_once() {
        let err = StackError::BadAction("x".into())
            .in_stack(vec![PathBuf::from("/a/b"), PathBuf::from("/a")])
            .in_stack(vec![PathBuf::from("/other")]);
        let msg = err.to_string();
        assert!(msg.contains("invalid action: x"));
        assert!(msg.contains("    /a/b\n    /a"));
        assert!(!msg.contains("/other"));
    }

    #[test]
    fn cancelled_is_never_wrapped() {
        let err = StackError::Cancelled.in_stack(vec![PathBuf::from("/a")]);
        assert!(matches!(err, StackError::Cancelled));
        assert!(err.is_cancelled());
    }
}
