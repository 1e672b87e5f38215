//! The engine's value model and per-sample `Context`.
//!
//! `Value` is an opaque tagged value exchanged between steps: a scalar
//! (string / number / bool / null), an ordered list, or a string-keyed map.
//! Values are immutable after construction and strictly tree-shaped — no
//! back-references — so the Context built out of them can never cycle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Render the value in its string form, used by the `concat` aggregation
    /// strategy and by code-node argument serialization.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            Value::List(_) | Value::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Per-sample mutable mapping from context key to `Value`, seeded with the
/// sample's declared input fields.
///
/// A key is written at most once per sample: the declared `output_key` of
/// its producing step. Reading an absent key yields the empty string
/// (never an error) and is logged as a warning — callers resolving
/// `input_mapping` entries rely on this rather than handling a missing-key
/// error path.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a Context from a sample's declared input fields.
    pub fn from_sample(fields: HashMap<String, Value>) -> Self {
        Self { values: fields }
    }

    /// Read a key; missing keys resolve to the empty string, logged once per
    /// read at `warn` level rather than raised as an error.
    pub fn get(&self, key: &str) -> Value {
        match self.values.get(key) {
            Some(v) => v.clone(),
            None => {
                warn!(context_key = key, "context key not found, using empty string");
                Value::String(String::new())
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Write a step's output under its `output_key`. Call sites are
    /// expected to call this at most once per key per sample; the Context
    /// itself does not enforce that invariant, since the scheduler is the
    /// sole writer and already guarantees it by construction (§4.E).
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Project a set of declared output keys out of the Context.
    pub fn project(&self, keys: &[String]) -> HashMap<String, Value> {
        keys.iter()
            .map(|k| (k.clone(), self.get(k)))
            .collect()
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_returns_empty_string() {
        let ctx = Context::new();
        assert_eq!(ctx.get("nope"), Value::String(String::new()));
    }

    #[test]
    fn test_write_then_read() {
        let mut ctx = Context::new();
        ctx.set("x", Value::from("hello"));
        assert_eq!(ctx.get("x"), Value::String("hello".to_string()));
    }

    #[test]
    fn test_project_includes_missing_as_empty() {
        let mut ctx = Context::new();
        ctx.set("a", Value::from(1.0));
        let projected = ctx.project(&["a".to_string(), "b".to_string()]);
        assert_eq!(projected["a"], Value::Number(1.0));
        assert_eq!(projected["b"], Value::String(String::new()));
    }

    #[test]
    fn test_display_string_scalar() {
        assert_eq!(Value::from("hi").to_display_string(), "hi");
        assert_eq!(Value::Bool(true).to_display_string(), "true");
        assert_eq!(Value::Null.to_display_string(), "");
    }
}
