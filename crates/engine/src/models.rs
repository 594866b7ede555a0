//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like
//! in memory. They serialise to and from the JSON `definition` column of
//! the `workflows` table.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a workflow is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Started explicitly by a user or the CLI.
    Manual,
    /// Fired when an entity of `entity_type` sees `event_type`
    /// (`created`, `updated`, `deleted`).
    DataEvent {
        entity_type: String,
        event_type: String,
    },
    /// Fired on a cron schedule.
    Scheduled {
        /// Standard cron expression (5 fields).
        cron_expression: String,
    },
    /// Fired by an incoming HTTP request.
    ApiWebhook {
        webhook_path: String,
        #[serde(default = "default_http_method")]
        http_method: String,
    },
    /// Invoked by another workflow through a `call_workflow` step.
    WorkflowCall,
}

fn default_http_method() -> String {
    "POST".to_owned()
}

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// The closed set of step kinds a workflow may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    CreateEntity,
    UpdateEntity,
    DeleteEntity,
    QueryEntity,
    ApiCall,
    SendEmail,
    Condition,
    Loop,
    ScheduleWorkflow,
    CallWorkflow,
    TransformData,
    ValidateData,
    PluginAction,
    SetExecutionState,
    Log,
}

impl StepType {
    pub const ALL: [StepType; 15] = [
        Self::CreateEntity,
        Self::UpdateEntity,
        Self::DeleteEntity,
        Self::QueryEntity,
        Self::ApiCall,
        Self::SendEmail,
        Self::Condition,
        Self::Loop,
        Self::ScheduleWorkflow,
        Self::CallWorkflow,
        Self::TransformData,
        Self::ValidateData,
        Self::PluginAction,
        Self::SetExecutionState,
        Self::Log,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateEntity => "create_entity",
            Self::UpdateEntity => "update_entity",
            Self::DeleteEntity => "delete_entity",
            Self::QueryEntity => "query_entity",
            Self::ApiCall => "api_call",
            Self::SendEmail => "send_email",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::ScheduleWorkflow => "schedule_workflow",
            Self::CallWorkflow => "call_workflow",
            Self::TransformData => "transform_data",
            Self::ValidateData => "validate_data",
            Self::PluginAction => "plugin_action",
            Self::SetExecutionState => "set_execution_state",
            Self::Log => "log",
        }
    }

    /// Entity reads and writes; charged against the db-query budget.
    pub fn is_data_access(self) -> bool {
        matches!(
            self,
            Self::CreateEntity | Self::UpdateEntity | Self::DeleteEntity | Self::QueryEntity
        )
    }

    pub fn is_external_call(self) -> bool {
        self == Self::ApiCall
    }

    pub fn is_email(self) -> bool {
        self == Self::SendEmail
    }

    /// Config keys a node of this kind is expected to carry.
    pub fn required_config(self) -> &'static [&'static str] {
        match self {
            Self::ApiCall => &["method", "url"],
            Self::CreateEntity => &["entity_type"],
            Self::UpdateEntity | Self::DeleteEntity => &["entity_uid"],
            Self::SendEmail => &["to"],
            Self::Condition => &["expression"],
            Self::Loop => &["collection"],
            _ => &[],
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown step type '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// ErrorStrategy
// ---------------------------------------------------------------------------

/// What the executor does when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Abort the whole execution.
    #[default]
    Stop,
    /// Record `{"error": message}` as the step's output and carry on.
    Continue,
    /// Re-run the step with exponential back-off, then behave like `Stop`.
    Retry,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow; referenced by `depends_on` and `$uid`.
    pub uid: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Handler parameters. String values of the form `$name` are resolved
    /// right before dispatch.
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Guard; the step is skipped when it evaluates falsy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_when: Option<String>,
    #[serde(default)]
    pub on_error: ErrorStrategy,
    /// Overrides the engine-wide step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extra attempts allowed under [`ErrorStrategy::Retry`].
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Step {
    pub fn new(uid: impl Into<String>, step_type: StepType) -> Self {
        Self {
            uid: uid.into(),
            step_type,
            name: None,
            params: Map::new(),
            depends_on: Vec::new(),
            only_when: None,
            on_error: ErrorStrategy::Stop,
            timeout_ms: None,
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn only_when(mut self, guard: impl Into<String>) -> Self {
        self.only_when = Some(guard.into());
        self
    }

    pub fn on_error(mut self, strategy: ErrorStrategy) -> Self {
        self.on_error = strategy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Switch to [`ErrorStrategy::Retry`] with `max_retries` extra attempts.
    pub fn retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.on_error = ErrorStrategy::Retry;
        self.max_retries = max_retries;
        self.retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Total attempts the executor may make for this step.
    pub fn max_attempts(&self) -> u32 {
        match self.on_error {
            ErrorStrategy::Retry => self.max_retries.saturating_add(1),
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub uid: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub trigger: Trigger,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Initial variables, seeded into the execution state.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Cap on concurrently running steps; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    /// Whole-run timeout; never exceeds the engine-wide ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

pub(crate) fn default_version() -> u32 {
    1
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, trigger: Trigger, steps: Vec<Step>) -> Self {
        Self {
            uid: format!("wf_{}", short_id()),
            name: name.into(),
            version: default_version(),
            trigger,
            steps,
            variables: Map::new(),
            max_concurrent: None,
            timeout_ms: None,
        }
    }

    pub fn step(&self, uid: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.uid == uid)
    }
}

/// First 12 hex digits of a fresh v4 UUID.
pub(crate) fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}
