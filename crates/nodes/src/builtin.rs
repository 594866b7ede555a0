//! Handlers for the step kinds the engine can run without any registration.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::{ExecutionContext, NodeError, StepHandler};

/// Tracing target of every message written by [`LogStep`].
pub const LOG_TARGET: &str = "workflow";

/// `log`: writes `message` through `tracing` at `level` (default `info`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStep;

#[async_trait]
impl StepHandler for LogStep {
    async fn handle(
        &self,
        params: Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let message = match params.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let level = params.get("level").and_then(Value::as_str).unwrap_or("info");

        match level {
            "debug" => debug!(target: LOG_TARGET, "{message}"),
            "warn" | "warning" => warn!(target: LOG_TARGET, "{message}"),
            "error" => error!(target: LOG_TARGET, "{message}"),
            _ => info!(target: LOG_TARGET, "{message}"),
        }

        Ok(json!({ "logged": message }))
    }
}

/// `set_execution_state`: stores `value` under `name` in the execution state.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetExecutionStateStep;

#[async_trait]
impl StepHandler for SetExecutionStateStep {
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::InvalidParam {
                name: "name".into(),
                reason: "expected a string".into(),
            })?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);

        ctx.set_state(name, value.clone());
        Ok(json!({ "set": name, "value": value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn log_step_echoes_message() {
        let ctx = ExecutionContext::new();
        let out = LogStep
            .handle(params(json!({ "message": "hello", "level": "warn" })), &ctx)
            .await
            .unwrap();
        assert_eq!(out, json!({ "logged": "hello" }));
    }

    #[tokio::test]
    async fn set_state_writes_into_context() {
        let ctx = ExecutionContext::new();
        let out = SetExecutionStateStep
            .handle(params(json!({ "name": "stage", "value": 2 })), &ctx)
            .await
            .unwrap();
        assert_eq!(out, json!({ "set": "stage", "value": 2 }));
        assert_eq!(ctx.get("stage"), Some(json!(2)));
    }

    #[tokio::test]
    async fn set_state_without_name_is_rejected() {
        let ctx = ExecutionContext::new();
        let err = SetExecutionStateStep
            .handle(params(json!({ "value": 2 })), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidParam { ref name, .. } if name == "name"));
    }
}
