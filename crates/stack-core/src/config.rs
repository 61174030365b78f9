use crate::error::{Result, StackError};
use crate::io;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SUPPORTED_API: &str = "v1";

/// Keys that mark a mapping in `stacks` as an inline unit rather than a
/// directory prefix or a parametrized declaration.
pub const INLINE_UNIT_KEYS: [&str; 6] = ["run", "stacks", "pstacks", "flags", "vars", "locals"];

/// Raw unit document as written in `stack.yaml`.
///
/// Unknown keys are rejected; actions and child declarations stay as raw
/// values and are parsed by the unit loader.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UnitConfig {
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub vars: Map<String, Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub vars_from: Vec<VarsSource>,
    #[serde(default, deserialize_with = "null_default")]
    pub flags: Map<String, Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub locals: Map<String, Value>,
    #[serde(default)]
    pub libs: Option<Libs>,
    #[serde(default, deserialize_with = "null_default")]
    pub pre_run: Vec<Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub run: Vec<Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub post_run: Vec<Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub stacks: Vec<Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub pstacks: Vec<Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub when: String,
    #[serde(default, deserialize_with = "null_default")]
    pub wait: String,
    #[serde(default, with = "humantime_serde")]
    pub wait_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "null_default")]
    pub wait_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarsSource {
    File(PathBuf),
    Sops(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Libs {
    One(String),
    Many(Vec<LibItem>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LibItem {
    Path(String),
    Git {
        git: String,
        #[serde(default, rename = "ref")]
        reference: Option<String>,
        #[serde(default)]
        path: Option<String>,
    },
}

impl Libs {
    pub fn items(&self) -> Vec<LibItem> {
        match self {
            Libs::One(path) => vec![LibItem::Path(path.clone())],
            Libs::Many(items) => items.clone(),
        }
    }
}

fn null_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

impl UnitConfig {
    /// Load and validate a unit file. File units must declare `api: v1`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = io::read_document(path)?;
        let config = Self::from_value(raw, path)?;
        config.check_api(None)?;
        Ok(config)
    }

    /// Validate an already-decoded document. `origin` names it in errors.
    pub fn from_value(raw: Value, origin: &Path) -> Result<Self> {
        if !raw.is_object() {
            return Err(StackError::BadConfig {
                path: origin.to_path_buf(),
                reason: "stack config must be a map".to_string(),
            });
        }
        serde_json::from_value(raw).map_err(|e| StackError::BadConfig {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Resolve the api tag, inheriting `parent` when absent.
    pub fn check_api(&self, parent: Option<&str>) -> Result<String> {
        match self.api.as_deref().or(parent) {
            Some(SUPPORTED_API) => Ok(SUPPORTED_API.to_string()),
            Some(other) => Err(StackError::UnsupportedApi(other.to_string())),
            None => Err(StackError::UnsupportedApi(String::new())),
        }
    }
}

/// True when a `stacks` entry mapping declares an inline unit.
pub fn is_inline_unit(map: &Map<String, Value>) -> bool {
    map.get("name").is_some_and(Value::is_string)
        && INLINE_UNIT_KEYS.iter().any(|k| map.contains_key(*k))
}
