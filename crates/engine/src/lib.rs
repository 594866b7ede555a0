//! `engine` crate: workflow models, graph compilation, and the concurrent
//! executor.

pub mod budget;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod log;
pub mod models;
pub mod params;
pub mod registry;

pub use budget::{BudgetCounter, BudgetExceeded, ExecutionBudget};
pub use compiler::{compile, validate};
pub use config::{EngineConfig, ExecutionLimits, PersistenceBackend, PersistenceConfig};
pub use db::ExecutionStatus;
pub use engine::WorkflowEngine;
pub use error::{CompilationError, EngineError, StepError};
pub use events::{EventBus, ExecutionEvent};
pub use executor::{RunHandle, WorkflowExecutor};
pub use graph::{
    ExecutionGroup, ExecutionPlan, GraphDocument, GraphEdge, GraphNode, IssueCode, Severity,
    ValidationIssue, ValidationResult, TRIGGER_UID,
};
pub use log::{ErrorKind, ExecutionError, ExecutionLog, StepResult};
pub use models::{ErrorStrategy, Step, StepType, Trigger, Workflow};
pub use registry::StepRegistry;

#[cfg(test)]
mod executor_tests;
