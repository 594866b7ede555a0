//! SQLite queries behind [`crate::SqliteStore`], one function per statement.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Rows are mapped to the records in [`crate::models`] and nothing else.

pub mod executions;
pub mod workflows;
