//! SQLite-backed implementations of the storage contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    DbError, DbPool,
    models::{ExecutionRecord, ExecutionStatus, WorkflowRecord},
    pool,
    repository::{
        executions::{self, LookupColumn},
        workflows,
    },
    store::{ExecutionStore, WorkflowStore},
};

/// Upper bound for listing queries that take no explicit limit.
const LIST_LIMIT: usize = 10_000;

/// One pool serving both executions and workflow definitions.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open `database_url`, run migrations and wrap the pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = pool::create_pool(database_url, max_connections).await?;
        pool::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        executions::upsert_execution(&self.pool, record).await
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, DbError> {
        executions::get_execution(&self.pool, execution_id).await
    }

    async fn delete(&self, execution_id: &str) -> Result<bool, DbError> {
        executions::delete_execution(&self.pool, execution_id).await
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        executions::list_by_statuses(&self.pool, &[status], LIST_LIMIT).await
    }

    async fn list_active(&self) -> Result<Vec<ExecutionRecord>, DbError> {
        executions::list_by_statuses(
            &self.pool,
            &[ExecutionStatus::Pending, ExecutionStatus::Running],
            LIST_LIMIT,
        )
        .await
    }

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<Value>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        executions::update_execution_status(
            &self.pool,
            execution_id,
            status,
            error.as_ref(),
            completed_at,
        )
        .await
    }

    async fn append_step_log(&self, execution_id: &str, step_log: Value) -> Result<bool, DbError> {
        executions::insert_step_log(&self.pool, execution_id, &step_log).await
    }

    async fn list_for_workflow(
        &self,
        workflow_uid: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        executions::list_by_column(&self.pool, LookupColumn::WorkflowUid, workflow_uid, limit).await
    }

    async fn list_for_user(
        &self,
        user_uid: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        executions::list_by_column(&self.pool, LookupColumn::UserUid, user_uid, limit).await
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), DbError> {
        workflows::upsert_workflow(&self.pool, record).await
    }

    async fn get_workflow(
        &self,
        uid: &str,
        version: u32,
    ) -> Result<Option<WorkflowRecord>, DbError> {
        workflows::get_workflow(&self.pool, uid, version).await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, DbError> {
        workflows::list_workflows(&self.pool).await
    }

    async fn delete_workflow(&self, uid: &str) -> Result<bool, DbError> {
        workflows::delete_workflow(&self.pool, uid).await
    }
}
