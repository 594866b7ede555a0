//! `db` crate: pure persistence layer.
//!
//! Provides the storage contracts the engine writes execution records and
//! workflow definitions through, an in-memory backend, and a SQLite backend
//! built on a connection pool and repository functions. No business logic
//! lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod sqlite;
pub mod store;

pub use error::DbError;
pub use memory::{InMemoryExecutionStore, InMemoryWorkflowStore};
pub use models::{ExecutionRecord, ExecutionStatus, WorkflowRecord};
pub use pool::DbPool;
pub use sqlite::SqliteStore;
pub use store::{ExecutionStore, WorkflowStore};
