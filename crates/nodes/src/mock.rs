//! `MockStep` and `ScriptedStep`, test doubles for `StepHandler`.
//!
//! Useful in unit and integration tests where a real handler is either
//! unavailable or irrelevant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ExecutionContext, NodeError, StepHandler};

/// Behaviour injected into `MockStep` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with the given message.
    Fail(String),
    /// Sleep, then return the value.
    SleepThenReturn(Duration, Value),
    /// Sleep, then fail.
    SleepThenFail(Duration, String),
    /// Fail the first `failures` calls, then return the value.
    FlakyThenReturn { failures: usize, value: Value },
}

/// A mock handler that records every call it receives and returns a
/// programmer-specified result.
#[derive(Debug, Clone)]
pub struct MockStep {
    /// Label used in test assertions.
    pub name: String,
    /// What the handler will do when `handle` is called.
    pub behaviour: MockBehaviour,
    /// All params seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<Map<String, Value>>>>,
}

impl MockStep {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Fail(msg.into()))
    }

    /// Create a mock that sleeps for `delay` and then succeeds.
    pub fn sleeping(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with(name, MockBehaviour::SleepThenReturn(delay, value))
    }

    /// Create a mock that sleeps for `delay` and then fails.
    pub fn sleeping_then_failing(
        name: impl Into<String>,
        delay: Duration,
        msg: impl Into<String>,
    ) -> Self {
        Self::with(name, MockBehaviour::SleepThenFail(delay, msg.into()))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with(name, MockBehaviour::FlakyThenReturn { failures, value })
    }

    /// Number of times this handler has been called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Params of the most recent call.
    pub fn last_params(&self) -> Option<Map<String, Value>> {
        self.calls.lock().unwrap().last().cloned()
    }

    fn output(&self, value: &Value) -> Value {
        // Tag the output with the mock's name so tests can trace data flow.
        let mut out = json!({ "step": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl StepHandler for MockStep {
    async fn handle(
        &self,
        params: Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(params);
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::Fail(msg) => Err(NodeError::failed(msg.clone())),
            MockBehaviour::SleepThenReturn(delay, v) => {
                tokio::time::sleep(*delay).await;
                Ok(self.output(v))
            }
            MockBehaviour::SleepThenFail(delay, msg) => {
                tokio::time::sleep(*delay).await;
                Err(NodeError::failed(msg.clone()))
            }
            MockBehaviour::FlakyThenReturn { failures, value } => {
                if call_number <= *failures {
                    Err(NodeError::failed(format!(
                        "{} transient failure #{call_number}",
                        self.name
                    )))
                } else {
                    Ok(self.output(value))
                }
            }
        }
    }
}

/// A handler whose behaviour is read from each step's own params, so one
/// registration can drive many differently-behaving steps of the same kind.
///
/// Recognised params:
/// - `delay_ms`: sleep before answering.
/// - `fail`: fail with this message.
/// - `output`: value to return; defaults to the params themselves.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStep {
    pub calls: Arc<Mutex<Vec<Map<String, Value>>>>,
}

impl ScriptedStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Values of the `label` param for every call so far, in call order.
    pub fn labels(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.get("label").and_then(Value::as_str).map(str::to_owned))
            .collect()
    }
}

#[async_trait]
impl StepHandler for ScriptedStep {
    async fn handle(
        &self,
        params: Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        self.calls.lock().unwrap().push(params.clone());

        if let Some(ms) = params.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(msg) = params.get("fail").and_then(Value::as_str) {
            return Err(NodeError::failed(msg));
        }
        Ok(params
            .get("output")
            .cloned()
            .unwrap_or(Value::Object(params)))
    }
}
