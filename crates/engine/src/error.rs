//! Engine-level error types.

use std::time::Duration;

use thiserror::Error;

use db::ExecutionStatus;
use nodes::NodeError;

use crate::graph::{IssueCode, ValidationIssue};

/// Errors returned by the engine's public operations.
///
/// Failures *inside* a run are not errors of this type; they end up on the
/// run's `ExecutionLog` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow did not compile.
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("workflow '{uid}' version {version} not found in workflow storage")]
    WorkflowNotFound { uid: String, version: u32 },

    /// Re-running needs the original definition, not just the input snapshot.
    #[error("retry of execution '{0}' is not supported without workflow storage")]
    RetryUnsupported(String),

    #[error("execution '{execution_id}' is {status}; only finished runs can be retried")]
    NotRetryable {
        execution_id: String,
        status: ExecutionStatus,
    },

    /// A stored record or definition could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}

/// The first blocking issue of a graph that failed to compile.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct CompilationError {
    pub code: IssueCode,
    pub message: String,
    pub nodes: Vec<String>,
    pub edges: Vec<String>,
}

impl From<&ValidationIssue> for CompilationError {
    fn from(issue: &ValidationIssue) -> Self {
        Self {
            code: issue.code,
            message: issue.message.clone(),
            nodes: issue.nodes.clone(),
            edges: issue.edges.clone(),
        }
    }
}

/// Why a single step attempt failed.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error(transparent)]
    Handler(#[from] NodeError),

    #[error("step handler panicked: {0}")]
    Panicked(String),

    #[error("step timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}
