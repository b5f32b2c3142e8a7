//! # Variable Store
//!
//! Per-execution key-value state readable by expressions and writable by
//! actions. Values are `serde_json::Value`, covering null, booleans, integers,
//! floats, strings, arrays and objects.
//!
//! The store is exclusively owned by one executor at a time. Parallel branches
//! receive a copy-on-branch snapshot and write into a [`VariableDelta`] that is
//! merged back on join, so concurrent writers never share the same map.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::definition::VariableType;

/// Truthiness used wherever a value stands in for a boolean:
/// `null`, `0`, `""` and `[]` are false, everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i != 0
            } else {
                n.as_f64().map(|f| f != 0.0).unwrap_or(true)
            }
        }
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// The per-execution variable store.
///
/// Declared types from the workflow definition are advisory: the runtime
/// accepts any value but keeps the declaration around for tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableStore {
    values: HashMap<String, Value>,
    #[serde(default)]
    declared: HashMap<String, VariableType>,
}

impl VariableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under the given name, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Look up a value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Remove a value, returning it if it existed.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Check whether a name is set.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// All variable names currently set.
    pub fn names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Number of variables currently set.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no variables.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Record the declared type of a variable.
    pub fn declare(&mut self, name: impl Into<String>, var_type: VariableType) {
        self.declared.insert(name.into(), var_type);
    }

    /// The declared type of a variable, if the definition declared one.
    pub fn declared_type(&self, name: &str) -> Option<VariableType> {
        self.declared.get(name).copied()
    }

    /// Apply a delta produced by a node or branch.
    pub fn apply(&mut self, delta: &VariableDelta) {
        for (name, change) in &delta.changes {
            match change {
                Some(value) => {
                    self.values.insert(name.clone(), value.clone());
                }
                None => {
                    self.values.remove(name);
                }
            }
        }
    }

    /// Snapshot of the raw values, for read-only consumers such as plugins.
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }
}

/// An explicit set of variable changes.
///
/// Deltas are how node executors report writes: a key mapped to `Some(value)`
/// is a set, a key mapped to `None` is a removal. Merging deltas across
/// parallel branches is last-writer-wins in completion order; collisions are
/// reported to the caller so they can be recorded in node metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariableDelta {
    changes: HashMap<String, Option<Value>>,
}

impl VariableDelta {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a variable write.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.changes.insert(name.into(), Some(value));
    }

    /// Record a variable removal.
    pub fn unset(&mut self, name: impl Into<String>) {
        self.changes.insert(name.into(), None);
    }

    /// Look up a pending change.
    pub fn get(&self, name: &str) -> Option<&Option<Value>> {
        self.changes.get(name)
    }

    /// Whether the delta records no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of recorded changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterate over the recorded changes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Value>)> {
        self.changes.iter()
    }

    /// Fold another delta into this one, returning the keys both deltas
    /// touched. The incoming delta wins on collision.
    pub fn merge(&mut self, other: &VariableDelta) -> Vec<String> {
        let mut collisions = Vec::new();
        for (name, change) in &other.changes {
            if self.changes.contains_key(name) {
                collisions.push(name.clone());
            }
            self.changes.insert(name.clone(), change.clone());
        }
        collisions
    }

    /// Build a delta that sets every entry of the given map.
    pub fn from_map(map: HashMap<String, Value>) -> Self {
        Self {
            changes: map.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        }
    }
}
