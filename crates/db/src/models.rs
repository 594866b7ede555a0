//! Persistence records.
//!
//! These are *persistence* models; they carry no domain behaviour. Step logs,
//! errors and snapshots are opaque JSON here; their shape is owned by the
//! `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Possible statuses for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Pending and running executions.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "paused"    => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            "timeout"   => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A persisted workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_uid: String,
    /// Version of the definition this execution ran.
    #[serde(default = "first_version")]
    pub workflow_version: u32,
    pub user_uid: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Step logs in completion order.
    pub step_logs: Vec<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub input_snapshot: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
}

impl ExecutionRecord {
    /// A fresh record with no step logs.
    pub fn new(
        execution_id: impl Into<String>,
        workflow_uid: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_uid: workflow_uid.into(),
            workflow_version: 1,
            user_uid: None,
            status,
            started_at: Utc::now(),
            completed_at: None,
            step_logs: Vec::new(),
            error: None,
            input_snapshot: None,
            output: None,
        }
    }
}

fn first_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition. `(uid, version)` identifies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub uid: String,
    pub version: u32,
    /// Full JSON workflow definition (steps, trigger, variables, …)
    pub definition: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}
