//! Payload shape compatibility between peers.
//!
//! Peers disagree on whether a single-valued payload travels as `{"x": 5}`
//! or as a bare `5`. The consumer knows which one field it expects, so the
//! codec can bridge both directions:
//!
//! - inbound: a bare scalar/array is wrapped into `{field: value}`
//! - outbound: `{field: value}` is unwrapped back to the bare value
//!
//! Objects that already have the expected shape pass through untouched,
//! so applying a rule twice is harmless.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Wrap a bare value into a single-field object.
///
/// Objects are returned unchanged.
pub fn wrap_single_field(value: Value, field: &str) -> Value {
    match value {
        Value::Object(_) => value,
        other => {
            let mut obj = Map::new();
            obj.insert(field.to_string(), other);
            Value::Object(obj)
        }
    }
}

/// Unwrap `{field: value}` into `value` when `value` is a scalar or array.
///
/// Anything else (other field names, several fields, nested objects) is
/// returned unchanged.
pub fn unwrap_single_field(value: Value, field: &str) -> Value {
    match value {
        Value::Object(mut obj) if obj.len() == 1 && obj.contains_key(field) => {
            match obj.remove(field) {
                Some(inner) if !inner.is_object() => inner,
                Some(inner) => {
                    obj.insert(field.to_string(), inner);
                    Value::Object(obj)
                }
                None => Value::Object(obj),
            }
        }
        other => other,
    }
}

/// Per-method shape rules for params and results.
///
/// Built once and then shared read-only between connections.
#[derive(Debug, Clone, Default)]
pub struct CompatRules {
    params: HashMap<String, String>,
    results: HashMap<String, String>,
}

impl CompatRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `method` consumes params shaped `{field: ...}`.
    pub fn params_field(mut self, method: impl Into<String>, field: impl Into<String>) -> Self {
        self.params.insert(method.into(), field.into());
        self
    }

    /// Declare that results of `method` are shaped `{field: ...}`.
    pub fn result_field(mut self, method: impl Into<String>, field: impl Into<String>) -> Self {
        self.results.insert(method.into(), field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.results.is_empty()
    }

    /// Params as the local handler expects them.
    pub fn inbound_params(&self, method: &str, params: Value) -> Value {
        match self.params.get(method) {
            Some(field) => wrap_single_field(params, field),
            None => params,
        }
    }

    /// Params as a bare-value peer expects them.
    pub fn outbound_params(&self, method: &str, params: Value) -> Value {
        match self.params.get(method) {
            Some(field) => unwrap_single_field(params, field),
            None => params,
        }
    }

    /// Result as the local caller expects it.
    pub fn inbound_result(&self, method: &str, result: Value) -> Value {
        match self.results.get(method) {
            Some(field) => wrap_single_field(result, field),
            None => result,
        }
    }

    /// Result as a bare-value peer expects it.
    pub fn outbound_result(&self, method: &str, result: Value) -> Value {
        match self.results.get(method) {
            Some(field) => unwrap_single_field(result, field),
            None => result,
        }
    }
}
