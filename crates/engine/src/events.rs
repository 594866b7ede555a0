//! Broadcast stream of run and step transitions.
//!
//! Publishing never blocks and never fails: with no subscribers the event is
//! dropped, and subscribers that fall behind see `RecvError::Lagged`.

use serde::Serialize;
use tokio::sync::broadcast;

use db::ExecutionStatus;

use crate::log::ExecutionError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: String,
        workflow_uid: String,
    },
    StepCompleted {
        execution_id: String,
        step_uid: String,
        duration_ms: u64,
    },
    StepFailed {
        execution_id: String,
        step_uid: String,
        error: String,
        /// `true` when the run carries on (`continue` policy).
        continued: bool,
    },
    StepSkipped {
        execution_id: String,
        step_uid: String,
        reason: String,
    },
    RunFinished {
        execution_id: String,
        status: ExecutionStatus,
        error: Option<ExecutionError>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::RunFinished { execution_id, .. } => execution_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
