//! The execution log: what happened during one run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use db::{ExecutionRecord, ExecutionStatus};

use crate::models::{default_version, Step, StepType};

// ---------------------------------------------------------------------------
// Run-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BudgetExceeded,
    /// A step failed under `stop` (or exhausted its retries). Includes
    /// step-level timeouts.
    StepFailed,
    /// The workflow-level timeout elapsed.
    Timeout,
    Cancelled,
    /// Scheduler inconsistency; indicates a bug.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::StepFailed => "step_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_uid: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_uid: None,
        }
    }

    pub fn at_step(mut self, step_uid: impl Into<String>) -> Self {
        self.step_uid = Some(step_uid.into());
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_uid {
            Some(uid) => write!(f, "{} at step '{uid}': {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_uid: String,
    pub step_type: StepType,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Params after `$name` resolution.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl StepResult {
    pub(crate) fn skipped(step: &Step, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_uid: step.uid.clone(),
            step_type: step.step_type,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            inputs: Map::new(),
            result: None,
            error: None,
            skipped: true,
            skip_reason: Some(reason.into()),
            attempts: 0,
        }
    }

    /// A step rejected before dispatch, e.g. over budget.
    pub(crate) fn rejected(
        step: &Step,
        inputs: Map<String, Value>,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            step_uid: step.uid.clone(),
            step_type: step.step_type,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            inputs,
            result: None,
            error: Some(error.into()),
            skipped: false,
            skip_reason: None,
            attempts: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.skipped
    }
}

// ---------------------------------------------------------------------------
// ExecutionLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub execution_id: String,
    pub workflow_uid: String,
    /// Version of the definition that ran; `retry` re-runs exactly this one.
    #[serde(default = "default_version")]
    pub workflow_version: u32,
    pub user_uid: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// In real completion order.
    pub steps: Vec<StepResult>,
    /// Step uid to its result; failed `continue` steps hold `{"error": ..}`.
    pub output: Map<String, Value>,
    pub error: Option<ExecutionError>,
    /// Context snapshot taken at submission; enough to rebuild the context.
    pub input_snapshot: Value,
}

impl ExecutionLog {
    pub fn new(
        execution_id: impl Into<String>,
        workflow_uid: impl Into<String>,
        user_uid: Option<String>,
        input_snapshot: Value,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_uid: workflow_uid.into(),
            workflow_version: default_version(),
            user_uid,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
            output: Map::new(),
            error: None,
            input_snapshot,
        }
    }

    pub fn step(&self, uid: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_uid == uid)
    }

    /// Step uids in completion order.
    pub fn step_order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_uid.as_str()).collect()
    }

    /// Move to a non-terminal status. Refused once the run is terminal.
    pub(crate) fn transition(&mut self, to: ExecutionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = to;
        true
    }

    /// Enter a terminal status. Only the first caller wins.
    pub(crate) fn finish(
        &mut self,
        status: ExecutionStatus,
        error: Option<ExecutionError>,
    ) -> bool {
        if !self.transition(status) {
            return false;
        }
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn to_record(&self) -> Result<ExecutionRecord, serde_json::Error> {
        Ok(ExecutionRecord {
            execution_id: self.execution_id.clone(),
            workflow_uid: self.workflow_uid.clone(),
            workflow_version: self.workflow_version,
            user_uid: self.user_uid.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            step_logs: self
                .steps
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
            error: self.error.as_ref().map(serde_json::to_value).transpose()?,
            input_snapshot: Some(self.input_snapshot.clone()),
            output: Some(Value::Object(self.output.clone())),
        })
    }
}

impl TryFrom<ExecutionRecord> for ExecutionLog {
    type Error = serde_json::Error;

    fn try_from(record: ExecutionRecord) -> Result<Self, Self::Error> {
        let steps = record
            .step_logs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        let error = record.error.map(serde_json::from_value).transpose()?;
        let output = match record.output {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(Self {
            execution_id: record.execution_id,
            workflow_uid: record.workflow_uid,
            workflow_version: record.workflow_version,
            user_uid: record.user_uid,
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            steps,
            output,
            error,
            input_snapshot: record.input_snapshot.unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_status_is_never_left() {
        let mut log = ExecutionLog::new("exec_1", "wf", None, Value::Null);
        assert!(log.transition(ExecutionStatus::Running));
        assert!(log.finish(
            ExecutionStatus::Cancelled,
            Some(ExecutionError::new(ErrorKind::Cancelled, "stop"))
        ));
        assert!(!log.finish(ExecutionStatus::Completed, None));
        assert!(!log.transition(ExecutionStatus::Running));
        assert_eq!(log.status, ExecutionStatus::Cancelled);
        assert_eq!(log.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn log_survives_a_trip_through_the_store_record() {
        let step = Step::new("a", StepType::Log);
        let mut log = ExecutionLog::new(
            "exec_2",
            "wf",
            Some("u1".into()),
            json!({ "input_params": { "x": 1 } }),
        );
        log.workflow_version = 4;
        log.steps.push(StepResult::skipped(&step, "guard"));
        log.output.insert("a".into(), Value::Null);
        log.finish(
            ExecutionStatus::Failed,
            Some(ExecutionError::new(ErrorKind::StepFailed, "boom").at_step("a")),
        );

        let record = log.to_record().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.workflow_version, 4);
        assert_eq!(record.error.as_ref().unwrap()["kind"], "step_failed");
        assert_eq!(record.step_logs[0]["skip_reason"], "guard");

        let back = ExecutionLog::try_from(record).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn error_display_names_kind_and_step() {
        let err = ExecutionError::new(ErrorKind::BudgetExceeded, "too many API calls (max: 2)")
            .at_step("call_3");
        assert_eq!(
            err.to_string(),
            "budget_exceeded at step 'call_3': too many API calls (max: 2)"
        );
    }
}
