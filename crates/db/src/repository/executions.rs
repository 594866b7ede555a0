//! Execution and step-log repository functions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::{
    DbError,
    models::{ExecutionRecord, ExecutionStatus},
};

const EXECUTION_COLUMNS: &str = "execution_id, workflow_uid, workflow_version, user_uid, status, \
     started_at, completed_at, error, input_snapshot, output";

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Insert or replace an execution row together with all of its step logs.
pub async fn upsert_execution(pool: &SqlitePool, record: &ExecutionRecord) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO executions
            (execution_id, workflow_uid, workflow_version, user_uid, status,
             started_at, completed_at, error, input_snapshot, output)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (execution_id) DO UPDATE SET
            workflow_uid     = excluded.workflow_uid,
            workflow_version = excluded.workflow_version,
            user_uid       = excluded.user_uid,
            status         = excluded.status,
            started_at     = excluded.started_at,
            completed_at   = excluded.completed_at,
            error          = excluded.error,
            input_snapshot = excluded.input_snapshot,
            output         = excluded.output
        "#,
    )
    .bind(&record.execution_id)
    .bind(&record.workflow_uid)
    .bind(i64::from(record.workflow_version))
    .bind(&record.user_uid)
    .bind(record.status.to_string())
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(to_text(record.error.as_ref())?)
    .bind(to_text(record.input_snapshot.as_ref())?)
    .bind(to_text(record.output.as_ref())?)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM execution_steps WHERE execution_id = ?")
        .bind(&record.execution_id)
        .execute(&mut *tx)
        .await?;

    for log in &record.step_logs {
        sqlx::query("INSERT INTO execution_steps (execution_id, log) VALUES (?, ?)")
            .bind(&record.execution_id)
            .bind(serde_json::to_string(log)?)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Fetch a single execution (with step logs) by id.
pub async fn get_execution(
    pool: &SqlitePool,
    execution_id: &str,
) -> Result<Option<ExecutionRecord>, DbError> {
    let row = sqlx::query(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?"
    ))
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(hydrate(pool, &row).await?)),
        None => Ok(None),
    }
}

/// Delete an execution and its step logs. Returns `true` if a row was removed.
pub async fn delete_execution(pool: &SqlitePool, execution_id: &str) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM execution_steps WHERE execution_id = ?")
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM executions WHERE execution_id = ?")
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(result.rows_affected() > 0)
}

/// Executions in any of `statuses`, newest first, at most `limit`.
pub async fn list_by_statuses(
    pool: &SqlitePool,
    statuses: &[ExecutionStatus],
    limit: usize,
) -> Result<Vec<ExecutionRecord>, DbError> {
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE status IN ({placeholders}) \
         ORDER BY started_at DESC LIMIT {limit}"
    );

    let mut query = sqlx::query(&sql);
    for status in statuses {
        query = query.bind(status.to_string());
    }
    let rows = query.fetch_all(pool).await?;
    hydrate_all(pool, &rows).await
}

/// Executions where `column` equals `value`, newest first.
///
/// `column` must be one of the indexed lookup columns.
pub async fn list_by_column(
    pool: &SqlitePool,
    column: LookupColumn,
    value: &str,
    limit: usize,
) -> Result<Vec<ExecutionRecord>, DbError> {
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE {} = ? \
         ORDER BY started_at DESC LIMIT {limit}",
        column.as_str()
    );
    let rows = sqlx::query(&sql).bind(value).fetch_all(pool).await?;
    hydrate_all(pool, &rows).await
}

#[derive(Debug, Clone, Copy)]
pub enum LookupColumn {
    WorkflowUid,
    UserUid,
}

impl LookupColumn {
    fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowUid => "workflow_uid",
            Self::UserUid => "user_uid",
        }
    }
}

/// Update the `status` (and optionally `error` / `completed_at`) of an execution.
pub async fn update_execution_status(
    pool: &SqlitePool,
    execution_id: &str,
    status: ExecutionStatus,
    error: Option<&Value>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status       = ?,
            error        = COALESCE(?, error),
            completed_at = COALESCE(?, completed_at)
        WHERE execution_id = ?
        "#,
    )
    .bind(status.to_string())
    .bind(to_text(error)?)
    .bind(completed_at)
    .bind(execution_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// execution_steps
// ---------------------------------------------------------------------------

/// Append one step log. Returns `false` if the execution does not exist.
pub async fn insert_step_log(
    pool: &SqlitePool,
    execution_id: &str,
    log: &Value,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO execution_steps (execution_id, log)
        SELECT execution_id, ? FROM executions WHERE execution_id = ?
        "#,
    )
    .bind(serde_json::to_string(log)?)
    .bind(execution_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn step_logs(pool: &SqlitePool, execution_id: &str) -> Result<Vec<Value>, DbError> {
    let rows = sqlx::query("SELECT log FROM execution_steps WHERE execution_id = ? ORDER BY id")
        .bind(execution_id)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| -> Result<Value, DbError> {
            let text: String = row.try_get("log")?;
            Ok(serde_json::from_str(&text)?)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

async fn hydrate_all(
    pool: &SqlitePool,
    rows: &[SqliteRow],
) -> Result<Vec<ExecutionRecord>, DbError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        records.push(hydrate(pool, row).await?);
    }
    Ok(records)
}

async fn hydrate(pool: &SqlitePool, row: &SqliteRow) -> Result<ExecutionRecord, DbError> {
    let execution_id: String = row.try_get("execution_id")?;
    let status: String = row.try_get("status")?;
    let status = status.parse::<ExecutionStatus>().map_err(DbError::InvalidRow)?;
    let version: i64 = row.try_get("workflow_version")?;

    Ok(ExecutionRecord {
        step_logs: step_logs(pool, &execution_id).await?,
        workflow_uid: row.try_get("workflow_uid")?,
        workflow_version: u32::try_from(version)
            .map_err(|_| DbError::InvalidRow(format!("workflow version out of range: {version}")))?,
        user_uid: row.try_get("user_uid")?,
        status,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: from_text(row.try_get("error")?)?,
        input_snapshot: from_text(row.try_get("input_snapshot")?)?,
        output: from_text(row.try_get("output")?)?,
        execution_id,
    })
}

fn to_text(value: Option<&Value>) -> Result<Option<String>, DbError> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn from_text(text: Option<String>) -> Result<Option<Value>, DbError> {
    Ok(text.as_deref().map(serde_json::from_str).transpose()?)
}
