//! The execution context handed to every step handler.
//!
//! Name lookups follow a fixed precedence: execution state, then input
//! parameters, then prior step outputs, then the parent context. Cloning a
//! context is cheap and clones share the same state and step-output maps, so
//! concurrently running handlers of one execution see each other's writes.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

/// Name under which the executing user is exposed to `$` references.
pub const CURRENT_USER: &str = "Current User";

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    user: Option<Value>,
    input_params: Arc<Map<String, Value>>,
    execution_state: Arc<DashMap<String, Value>>,
    workflow_data: Arc<DashMap<String, Value>>,
    parent: Option<Arc<ExecutionContext>>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_input(mut self, input_params: Map<String, Value>) -> Self {
        self.input_params = Arc::new(input_params);
        self
    }

    /// Seed the execution state, e.g. from a workflow's initial variables.
    pub fn with_state(self, state: Map<String, Value>) -> Self {
        for (key, value) in state {
            self.execution_state.insert(key, value);
        }
        self
    }

    /// Nest this context under `parent`; unresolved names fall through to it.
    pub fn with_parent(mut self, parent: Arc<ExecutionContext>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Attach the cancellation token of the run this context belongs to.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn user(&self) -> Option<&Value> {
        self.user.as_ref()
    }

    pub fn input_params(&self) -> &Map<String, Value> {
        &self.input_params
    }

    /// Resolve a name against the context.
    pub fn get(&self, name: &str) -> Option<Value> {
        if name == CURRENT_USER {
            return self.user.clone();
        }
        if let Some(value) = self.execution_state.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.input_params.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.workflow_data.get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(name))
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.execution_state.insert(key.into(), value);
    }

    pub fn set_result(&self, step_uid: impl Into<String>, value: Value) {
        self.workflow_data.insert(step_uid.into(), value);
    }

    /// Output previously recorded for `step_uid`, if any.
    pub fn result(&self, step_uid: &str) -> Option<Value> {
        self.workflow_data.get(step_uid).map(|v| v.clone())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Serializable copy of the context, kept on the execution log so a run
    /// can be reproduced later.
    pub fn snapshot(&self) -> Value {
        json!({
            "user": self.user,
            "execution_state": collect(&self.execution_state),
            "input_params": Value::Object((*self.input_params).clone()),
            "workflow_data": collect(&self.workflow_data),
        })
    }

    /// Rebuild a fresh context from a [`snapshot`](Self::snapshot).
    ///
    /// Step outputs are deliberately not restored: a re-run produces its own.
    pub fn from_snapshot(snapshot: &Value) -> Self {
        let object = |key: &str| {
            snapshot
                .get(key)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };

        let mut ctx = Self::new()
            .with_input(object("input_params"))
            .with_state(object("execution_state"));
        ctx.user = snapshot.get("user").filter(|u| !u.is_null()).cloned();
        ctx
    }
}

fn collect(map: &DashMap<String, Value>) -> Value {
    Value::Object(
        map.iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn lookup_precedence_is_state_then_input_then_results() {
        let ctx = ExecutionContext::new().with_input(input(&[
            ("shared", json!("from-input")),
            ("only_input", json!(1)),
        ]));
        ctx.set_result("shared", json!("from-result"));
        ctx.set_result("only_result", json!(2));

        assert_eq!(ctx.get("shared"), Some(json!("from-input")));
        assert_eq!(ctx.get("only_input"), Some(json!(1)));
        assert_eq!(ctx.get("only_result"), Some(json!(2)));

        ctx.set_state("shared", json!("from-state"));
        assert_eq!(ctx.get("shared"), Some(json!("from-state")));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn unresolved_names_fall_through_to_parent() {
        let parent = ExecutionContext::new().with_input(input(&[("tenant", json!("acme"))]));
        let child = ExecutionContext::new().with_parent(Arc::new(parent));
        assert_eq!(child.get("tenant"), Some(json!("acme")));
    }

    #[test]
    fn current_user_resolves_to_user() {
        let ctx = ExecutionContext::new().with_user(json!({ "uid": "u_1" }));
        assert_eq!(ctx.get(CURRENT_USER), Some(json!({ "uid": "u_1" })));
    }

    #[test]
    fn clones_share_state() {
        let ctx = ExecutionContext::new();
        let clone = ctx.clone();
        clone.set_state("counter", json!(3));
        assert_eq!(ctx.get("counter"), Some(json!(3)));
    }

    #[test]
    fn snapshot_restores_user_state_and_input_but_not_results() {
        let ctx = ExecutionContext::new()
            .with_user(json!({ "uid": "u_9" }))
            .with_input(input(&[("order", json!(42))]));
        ctx.set_state("phase", json!("billing"));
        ctx.set_result("step_one", json!({ "ok": true }));

        let restored = ExecutionContext::from_snapshot(&ctx.snapshot());
        assert_eq!(restored.user(), Some(&json!({ "uid": "u_9" })));
        assert_eq!(restored.get("order"), Some(json!(42)));
        assert_eq!(restored.get("phase"), Some(json!("billing")));
        assert_eq!(restored.result("step_one"), None);
    }
}
