//! Storage contracts consumed by the engine.
//!
//! Implementations must be safe to share between concurrently running
//! executions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    DbError,
    models::{ExecutionRecord, ExecutionStatus, WorkflowRecord},
};

/// Persistence for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Save or replace an execution record, step logs included.
    async fn save(&self, record: &ExecutionRecord) -> Result<(), DbError>;

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, DbError>;

    /// Returns `true` if a record was deleted.
    async fn delete(&self, execution_id: &str) -> Result<bool, DbError>;

    async fn list_by_status(&self, status: ExecutionStatus)
        -> Result<Vec<ExecutionRecord>, DbError>;

    /// All pending and running executions.
    async fn list_active(&self) -> Result<Vec<ExecutionRecord>, DbError>;

    /// Update the status, and optionally the error and completion time.
    /// Returns `true` if the record exists.
    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<Value>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError>;

    /// Append one step log. Returns `true` if the record exists.
    async fn append_step_log(&self, execution_id: &str, step_log: Value) -> Result<bool, DbError>;

    /// Most recent executions of a workflow in any status, newest first.
    async fn list_for_workflow(
        &self,
        workflow_uid: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError>;

    /// Most recent executions started by a user in any status, newest first.
    async fn list_for_user(
        &self,
        user_uid: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError>;
}

/// Persistence for workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace the definition stored under `(record.uid, record.version)`.
    /// Other versions of the same workflow are kept.
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError>;

    async fn get_workflow(
        &self,
        uid: &str,
        version: u32,
    ) -> Result<Option<WorkflowRecord>, DbError>;

    /// All stored definitions, most recently saved first.
    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, DbError>;

    /// Delete every version of `uid`. Returns `true` if anything was deleted.
    async fn delete_workflow(&self, uid: &str) -> Result<bool, DbError>;
}
