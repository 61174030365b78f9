//! Routing of action output to streams or back into unit state.

use crate::error::{Result, StackError};
use crate::unit::Unit;
use crate::value;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Vars,
    Flags,
    Locals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `yml2var`: parse the text as YAML/JSON.
    Structured,
    /// `str2var`: keep the text as a string.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    Stderr,
    Var {
        format: Format,
        scope: Scope,
        /// Dotted path inside the scope; empty means the scope itself.
        path: String,
    },
}

impl OutputTarget {
    pub fn parse(raw: &Value) -> Result<Self> {
        match raw {
            Value::String(s) if s == "stdout" => Ok(OutputTarget::Stdout),
            Value::String(s) if s == "stderr" => Ok(OutputTarget::Stderr),
            Value::Object(map) if map.len() == 1 => {
                let (key, dest) = map.iter().next().ok_or_else(|| bad(raw))?;
                let format = match key.as_str() {
                    "yml2var" => Format::Structured,
                    "str2var" => Format::Text,
                    _ => return Err(bad(raw)),
                };
                let dest = dest.as_str().ok_or_else(|| bad(raw))?;
                let (scope, path) = parse_destination(dest).ok_or_else(|| bad(raw))?;
                if format == Format::Text && path.is_empty() {
                    return Err(StackError::BadOutput(format!(
                        "str2var needs a key path, got '{dest}'"
                    )));
                }
                Ok(OutputTarget::Var {
                    format,
                    scope,
                    path,
                })
            }
            _ => Err(bad(raw)),
        }
    }

    pub fn parse_list(raw: Option<&Value>) -> Result<Vec<Self>> {
        match raw {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items.iter().map(Self::parse).collect(),
            Some(other) => Err(bad(other)),
        }
    }
}

fn bad(raw: &Value) -> StackError {
    StackError::BadOutput(raw.to_string())
}

fn parse_destination(dest: &str) -> Option<(Scope, String)> {
    let dest = dest.strip_prefix("stack.").unwrap_or(dest);
    let (head, rest) = match dest.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (dest, ""),
    };
    let scope = match head {
        "vars" => Scope::Vars,
        "flags" => Scope::Flags,
        "locals" => Scope::Locals,
        _ => return None,
    };
    if rest.split('.').any(str::is_empty) && !rest.is_empty() {
        return None;
    }
    Some((scope, rest.to_string()))
}

/// Send `text` to every target in order.
pub fn route(unit: &Unit, targets: &[OutputTarget], text: &str) -> Result<()> {
    for target in targets {
        match target {
            OutputTarget::Stdout => unit.runtime().stdout().write_block(text)?,
            OutputTarget::Stderr => unit.runtime().stderr().write_block(text)?,
            OutputTarget::Var {
                format,
                scope,
                path,
            } => {
                let value = match format {
                    Format::Structured => crate::io::parse_document(text)
                        .map_err(|e| StackError::BadOutput(format!("yml2var: {e}")))?,
                    Format::Text => Value::String(text.to_string()),
                };
                let update = wrap(value, path)?;
                match scope {
                    Scope::Vars => unit.add_vars_right(&update)?,
                    Scope::Flags => unit
                        .runtime()
                        .with_flags(|flags| value::merge_overwrite(flags, update)),
                    Scope::Locals => unit.with_locals(|locals| value::merge_overwrite(locals, update)),
                }
                tracing::debug!(unit = %unit.workdir().display(), ?scope, path = %path, "output stored");
            }
        }
    }
    Ok(())
}

fn wrap(value: Value, path: &str) -> Result<Map<String, Value>> {
    if path.is_empty() {
        return match value {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(StackError::TypeMismatch {
                path: "yml2var".to_string(),
                expected: "map",
                found: value::type_name(&other),
            }),
        };
    }
    let mut root = Map::new();
    value::set_path(&mut root, path, value)?;
    Ok(root)
}
