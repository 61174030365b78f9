//! Checked access to dynamic configuration values.
//!
//! All configuration decoded from YAML/JSON is carried as `serde_json::Value`.
//! The helpers here walk dotted paths (`a.b.0.c`) and merge mappings without
//! ever panicking on an unexpected shape.

use crate::error::{Result, StackError};
use serde_json::{Map, Value};

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Look up a dotted path. Numeric segments index into lists.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |cur, segment| match cur {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set a dotted path inside a mapping, creating intermediate mappings as needed.
/// A non-mapping value in the way is replaced.
pub fn set_path(root: &mut Map<String, Value>, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StackError::BadOutput(format!("empty segment in path '{path}'")));
    }
    insert_at(root, &segments, value);
    Ok(())
}

fn insert_at(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = entry {
                insert_at(child, rest, value);
            } else {
                let mut child = Map::new();
                insert_at(&mut child, rest, value);
                *entry = Value::Object(child);
            }
        }
    }
}

pub fn expect_str<'a>(value: &'a Value, path: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| mismatch(value, path, "string"))
}

pub fn expect_map<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| mismatch(value, path, "map"))
}

pub fn expect_list<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| mismatch(value, path, "list"))
}

pub fn expect_bool(value: &Value, path: &str) -> Result<bool> {
    value.as_bool().ok_or_else(|| mismatch(value, path, "bool"))
}

fn mismatch(value: &Value, path: &str, expected: &'static str) -> StackError {
    StackError::TypeMismatch {
        path: path.to_string(),
        expected,
        found: type_name(value),
    }
}

/// Deep merge where `src` wins on conflict. Nested mappings are merged,
/// everything else (lists included) is replaced.
pub fn merge_overwrite(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match (dst.get_mut(&key), value) {
            (Some(Value::Object(d)), Value::Object(s)) => merge_overwrite(d, s),
            (_, value) => {
                dst.insert(key, value);
            }
        }
    }
}

/// Deep merge that only fills keys missing from `dst`.
pub fn merge_missing(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match (dst.get_mut(&key), value) {
            (Some(Value::Object(d)), Value::Object(s)) => merge_missing(d, s),
            (Some(_), _) => {}
            (None, value) => {
                dst.insert(key, value);
            }
        }
    }
}
