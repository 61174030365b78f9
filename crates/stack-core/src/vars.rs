//! Stack variables and the modifier-aware merge.
//!
//! Keys in a `vars` mapping may carry trailing modifier suffixes that decide
//! how the key behaves when two variable sets are merged:
//!
//! | suffix | modifier | merge behavior when the key is on the left |
//! |--------|----------|--------------------------------------------|
//! | (none) | weak     | right side wins, maps recurse              |
//! | `~`    | weak     | same as no suffix, inherited by nested keys |
//! | `+`    | update   | left side wins, lists append, maps recurse  |
//! | `++`   | all-update | update, inherited by nested keys; appends weak lists |
//! | `-`    | clear    | left side wins, right side is ignored       |
//!
//! A `^` ends suffix parsing, so `name+^` declares the literal key `name+`.
//! Modifiers are fixed when a mapping is parsed and never inferred later.

use crate::error::{Result, StackError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const SUFFIX_ALL_UPDATE: &str = "++";
const SUFFIX_UPDATE: &str = "+";
const SUFFIX_CLEAR: &str = "-";
const SUFFIX_WEAK: &str = "~";
const SUFFIX_DELIMITER: &str = "^";

// ---------------------------------------------------------------------------
// Modifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub weak: bool,
    pub update: bool,
    pub all_update: bool,
    pub clear: bool,
}

impl Modifiers {
    /// Unsuffixed keys behave as weak.
    pub fn is_weak(&self) -> bool {
        self.weak || !(self.update || self.clear)
    }
}

/// Strip modifier suffixes from a raw key.
///
/// `parent` is the modifier record of the enclosing key when parsing a nested
/// mapping; `None` at the top level.
pub fn parse_var_modifiers(raw: &str, parent: Option<&Modifiers>) -> Result<(String, Modifiers)> {
    let bad = |reason: &str| StackError::BadVarName {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut modifiers = Modifiers::default();
    if let Some(p) = parent {
        modifiers.weak = p.weak;
        if p.all_update {
            modifiers.update = true;
            modifiers.all_update = true;
        }
    }
    let update_allowed_here = parent.is_none_or(|p| p.update);

    let mut name = raw;
    loop {
        if let Some(rest) = name.strip_suffix(SUFFIX_ALL_UPDATE) {
            if modifiers.update || modifiers.weak || !update_allowed_here {
                return Err(bad("'++' is not allowed here"));
            }
            if modifiers.clear {
                return Err(bad("'++' cannot be combined with '-'"));
            }
            modifiers.update = true;
            modifiers.all_update = true;
            name = rest;
        } else if let Some(rest) = name.strip_suffix(SUFFIX_UPDATE) {
            if modifiers.update || modifiers.weak || !update_allowed_here {
                return Err(bad("'+' is not allowed here"));
            }
            if modifiers.clear {
                return Err(bad("'+' cannot be combined with '-'"));
            }
            modifiers.update = true;
            name = rest;
        } else if let Some(rest) = name.strip_suffix(SUFFIX_CLEAR) {
            if modifiers.clear || parent.is_some() {
                return Err(bad("'-' is only allowed once on a top-level key"));
            }
            if modifiers.update {
                return Err(bad("'-' cannot be combined with '+'"));
            }
            modifiers.clear = true;
            name = rest;
        } else if let Some(rest) = name.strip_suffix(SUFFIX_WEAK) {
            if modifiers.update || modifiers.weak || parent.is_some() {
                return Err(bad("'~' is not allowed here"));
            }
            modifiers.weak = true;
            name = rest;
        } else {
            if let Some(rest) = name.strip_suffix(SUFFIX_DELIMITER) {
                name = rest;
            }
            break;
        }
    }

    if name.is_empty() {
        return Err(bad("empty name"));
    }
    Ok((name.to_string(), modifiers))
}

// ---------------------------------------------------------------------------
// Vars tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub modifiers: Modifiers,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Value(Value),
    Map(Vars),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vars {
    entries: BTreeMap<String, Entry>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw `vars` mapping, stripping and validating key suffixes.
    pub fn parse(raw: &Map<String, Value>) -> Result<Self> {
        Self::parse_nested(raw, None)
    }

    fn parse_nested(raw: &Map<String, Value>, parent: Option<&Modifiers>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (raw_name, value) in raw {
            let (name, modifiers) = parse_var_modifiers(raw_name, parent)?;
            if entries.contains_key(&name) {
                return Err(StackError::VarDoubleDefinition(name));
            }
            let node = match value {
                Value::Object(map) => Node::Map(Self::parse_nested(map, Some(&modifiers))?),
                other => Node::Value(other.clone()),
            };
            entries.insert(name, Entry { modifiers, node });
        }
        Ok(Self { entries })
    }

    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    /// Materialize as a plain mapping with suffixes stripped.
    pub fn to_map(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(k, e)| {
                let v = match &e.node {
                    Node::Value(v) => v.clone(),
                    Node::Map(m) => Value::Object(m.to_map()),
                };
                (k.clone(), v)
            })
            .collect()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Combine two variable sets. `left` is the ancestor or earlier source,
/// `right` the descendant or later one. The left key's modifiers decide.
pub fn merge(mut left: Vars, right: Vars) -> Vars {
    for (key, r) in right.entries {
        let combined = match left.entries.remove(&key) {
            Some(l) => combine(l, r),
            None => r,
        };
        left.entries.insert(key, combined);
    }
    left
}

fn combine(left: Entry, right: Entry) -> Entry {
    if left.modifiers.is_weak() {
        combine_weak(left, right)
    } else if left.modifiers.update {
        combine_update(left, right)
    } else {
        left
    }
}

fn combine_weak(left: Entry, right: Entry) -> Entry {
    if right.modifiers.clear {
        return right;
    }
    let modifiers = right.modifiers;
    let node = match (left.node, right.node) {
        (Node::Value(Value::Array(mut l)), Node::Value(Value::Array(r)))
            if modifiers.all_update =>
        {
            l.extend(r);
            Node::Value(Value::Array(l))
        }
        (Node::Map(l), Node::Map(r)) => Node::Map(merge(l, r)),
        (l, Node::Value(Value::Null)) => {
            return Entry {
                modifiers: left.modifiers,
                node: l,
            }
        }
        (_, r) => r,
    };
    Entry { modifiers, node }
}

fn combine_update(left: Entry, right: Entry) -> Entry {
    let modifiers = left.modifiers;
    let node = match (left.node, right.node) {
        (Node::Value(Value::Array(mut l)), Node::Value(Value::Array(r))) => {
            l.extend(r);
            Node::Value(Value::Array(l))
        }
        (Node::Map(l), Node::Map(r)) => Node::Map(merge(r, l)),
        (l, _) => l,
    };
    Entry { modifiers, node }
}
