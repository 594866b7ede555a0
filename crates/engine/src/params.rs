//! `$name` reference resolution and `only_when` guards.
//!
//! A string parameter of the form `$name` is replaced by the output of step
//! `name` if one exists, otherwise by the context's value for `name`, and by
//! `null` when neither knows it. Any other string is a literal. Arrays and
//! objects are resolved element by element.

use std::collections::HashMap;

use serde_json::{Map, Value};

use nodes::ExecutionContext;

pub fn resolve_params(
    params: &Map<String, Value>,
    results: &HashMap<String, Value>,
    ctx: &ExecutionContext,
) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, results, ctx)))
        .collect()
}

fn resolve_value(value: &Value, results: &HashMap<String, Value>, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => match reference(s) {
            Some(name) => lookup(name, results, ctx),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, results, ctx))
                .collect(),
        ),
        Value::Object(map) => Value::Object(resolve_params(map, results, ctx)),
        other => other.clone(),
    }
}

fn reference(s: &str) -> Option<&str> {
    s.strip_prefix('$').filter(|name| !name.is_empty())
}

fn lookup(name: &str, results: &HashMap<String, Value>, ctx: &ExecutionContext) -> Value {
    results
        .get(name)
        .cloned()
        .or_else(|| ctx.get(name))
        .unwrap_or(Value::Null)
}

/// Evaluate a guard: a `$name` reference or a JSON literal, optionally
/// negated with a leading `!`. Text that is neither is taken as a string.
pub fn guard_passes(expr: &str, results: &HashMap<String, Value>, ctx: &ExecutionContext) -> bool {
    let expr = expr.trim();
    let (negate, body) = match expr.strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, expr),
    };

    let value = match reference(body) {
        Some(name) => lookup(name, results, ctx),
        None => serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_owned())),
    };

    truthy(&value) != negate
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
