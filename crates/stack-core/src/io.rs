use crate::error::{Result, StackError};
use crate::value;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Read a YAML or JSON document.
pub fn read_document(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    parse_document(&text).map_err(|e| StackError::BadConfig {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub fn parse_document(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_yaml::from_str(text)?)
}

/// Read a document that must be a mapping; an empty file is an empty mapping.
pub fn read_map(path: &Path) -> Result<Map<String, Value>> {
    match read_document(path)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(StackError::TypeMismatch {
            path: path.display().to_string(),
            expected: "map",
            found: value::type_name(&other),
        }),
    }
}

fn sops_bin() -> Result<PathBuf> {
    which::which("sops").map_err(|_| StackError::ToolNotInstalled("sops"))
}

/// Decrypt a SOPS-encrypted YAML/JSON file with the `sops` binary.
pub fn read_sops_map(path: &Path) -> Result<Map<String, Value>> {
    let output = std::process::Command::new(sops_bin()?)
        .arg("--decrypt")
        .arg(path)
        .output()
        .map_err(|e| StackError::ToolFailed {
            tool: "sops",
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StackError::ToolFailed {
            tool: "sops",
            reason: format!("{}: {}", path.display(), stderr.trim()),
        });
    }
    match parse_document(&String::from_utf8_lossy(&output.stdout))? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(StackError::TypeMismatch {
            path: path.display().to_string(),
            expected: "map",
            found: value::type_name(&other),
        }),
    }
}

/// Read a file, or every file below a directory concatenated in path order.
pub fn read_path_contents(path: &Path) -> Result<String> {
    if !path.is_dir() {
        return Ok(std::fs::read_to_string(path)?);
    }
    let mut files = Vec::new();
    collect_files(path, &mut files)?;
    files.sort();
    let mut out = String::new();
    for file in files {
        out.push_str(&std::fs::read_to_string(&file)?);
    }
    Ok(out)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Write `value` as JSON to a temp file that lives as long as the handle.
pub fn write_temp_json(value: &Value) -> Result<NamedTempFile> {
    let mut tmp = tempfile::Builder::new().prefix("stack-vars-").suffix(".json").tempfile()?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.flush()?;
    Ok(tmp)
}

// ---------------------------------------------------------------------------
// --set values
// ---------------------------------------------------------------------------

/// Parse `a.b=1,c=text` style overrides into a nested mapping.
///
/// Values that read as YAML booleans, numbers or null keep that type;
/// everything else is a string. `\,` escapes a comma.
pub fn parse_set_values(items: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for item in items {
        for pair in split_unescaped(item) {
            if pair.is_empty() {
                continue;
            }
            let Some((key, raw)) = pair.split_once('=') else {
                return Err(StackError::BadSetValue(pair.clone()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(StackError::BadSetValue(pair.clone()));
            }
            value::set_path(&mut out, key, scalar(raw))
                .map_err(|_| StackError::BadSetValue(pair.clone()))?;
        }
    }
    Ok(out)
}

fn split_unescaped(s: &str) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                if let Some(p) = parts.last_mut() {
                    p.push(',');
                }
                chars.next();
            }
            ',' => parts.push(String::new()),
            c => {
                if let Some(p) = parts.last_mut() {
                    p.push(c);
                }
            }
        }
    }
    parts
}

fn scalar(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}
