//! Workflow definition CRUD operations.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::{DbError, models::WorkflowRecord};

/// Insert a workflow definition, replacing any earlier one with the same
/// uid and version. Other versions are left alone.
///
/// `definition` must be a JSON object produced by serialising the domain
/// `Workflow` type from the `engine` crate.
pub async fn upsert_workflow(pool: &SqlitePool, record: &WorkflowRecord) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflows (uid, version, definition, saved_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (uid, version) DO UPDATE SET
            definition = excluded.definition,
            saved_at   = excluded.saved_at
        "#,
    )
    .bind(&record.uid)
    .bind(i64::from(record.version))
    .bind(serde_json::to_string(&record.definition)?)
    .bind(record.saved_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch one version of a workflow.
pub async fn get_workflow(
    pool: &SqlitePool,
    uid: &str,
    version: u32,
) -> Result<Option<WorkflowRecord>, DbError> {
    let row = sqlx::query(
        "SELECT uid, version, definition, saved_at FROM workflows WHERE uid = ? AND version = ?",
    )
    .bind(uid)
    .bind(i64::from(version))
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(to_record).transpose()
}

/// Return all workflows ordered by save time (newest first).
pub async fn list_workflows(pool: &SqlitePool) -> Result<Vec<WorkflowRecord>, DbError> {
    let rows = sqlx::query(
        "SELECT uid, version, definition, saved_at FROM workflows ORDER BY saved_at DESC",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(to_record).collect()
}

/// Permanently delete every version of a workflow. Returns `true` if any
/// row was deleted.
pub async fn delete_workflow(pool: &SqlitePool, uid: &str) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM workflows WHERE uid = ?")
        .bind(uid)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn to_record(row: &SqliteRow) -> Result<WorkflowRecord, DbError> {
    let version: i64 = row.try_get("version")?;
    let definition: String = row.try_get("definition")?;

    Ok(WorkflowRecord {
        uid: row.try_get("uid")?,
        version: u32::try_from(version)
            .map_err(|_| DbError::InvalidRow(format!("workflow version out of range: {version}")))?,
        definition: serde_json::from_str(&definition)?,
        saved_at: row.try_get("saved_at")?,
    })
}
