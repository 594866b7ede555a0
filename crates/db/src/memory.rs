//! In-memory stores: fast, non-persistent, for tests and short-lived runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    DbError,
    models::{ExecutionRecord, ExecutionStatus, WorkflowRecord},
    store::{ExecutionStore, WorkflowStore},
};

/// Execution records held in a map; everything is lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }

    async fn filtered(&self, keep: impl Fn(&ExecutionRecord) -> bool) -> Vec<ExecutionRecord> {
        let mut out: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| keep(*r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        self.records
            .write()
            .await
            .insert(record.execution_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, DbError> {
        Ok(self.records.read().await.get(execution_id).cloned())
    }

    async fn delete(&self, execution_id: &str) -> Result<bool, DbError> {
        Ok(self.records.write().await.remove(execution_id).is_some())
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        Ok(self.filtered(|r| r.status == status).await)
    }

    async fn list_active(&self) -> Result<Vec<ExecutionRecord>, DbError> {
        Ok(self.filtered(|r| r.status.is_active()).await)
    }

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<Value>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(execution_id) else {
            return Ok(false);
        };
        record.status = status;
        if error.is_some() {
            record.error = error;
        }
        if completed_at.is_some() {
            record.completed_at = completed_at;
        }
        Ok(true)
    }

    async fn append_step_log(&self, execution_id: &str, step_log: Value) -> Result<bool, DbError> {
        let mut records = self.records.write().await;
        match records.get_mut(execution_id) {
            Some(record) => {
                record.step_logs.push(step_log);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_for_workflow(
        &self,
        workflow_uid: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        let mut out = self.filtered(|r| r.workflow_uid == workflow_uid).await;
        out.truncate(limit);
        Ok(out)
    }

    async fn list_for_user(
        &self,
        user_uid: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        let mut out = self
            .filtered(|r| r.user_uid.as_deref() == Some(user_uid))
            .await;
        out.truncate(limit);
        Ok(out)
    }
}

/// Workflow definitions held in a map, one entry per `(uid, version)`.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<(String, u32), WorkflowRecord>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        self.workflows
            .write()
            .await
            .insert((record.uid.clone(), record.version), record.clone());
        Ok(())
    }

    async fn get_workflow(
        &self,
        uid: &str,
        version: u32,
    ) -> Result<Option<WorkflowRecord>, DbError> {
        let key = (uid.to_owned(), version);
        Ok(self.workflows.read().await.get(&key).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, DbError> {
        let mut out: Vec<_> = self.workflows.read().await.values().cloned().collect();
        out.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(out)
    }

    async fn delete_workflow(&self, uid: &str) -> Result<bool, DbError> {
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|(stored_uid, _), _| stored_uid != uid);
        Ok(workflows.len() < before)
    }
}
