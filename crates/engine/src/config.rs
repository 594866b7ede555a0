//! Engine configuration.
//!
//! Built once by the caller (the CLI reads flags and environment) and passed
//! into [`crate::WorkflowEngine`]; nothing here is global.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-run ceilings and default timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    pub max_db_queries: u32,
    pub max_api_calls: u32,
    pub max_emails: u32,
    pub max_steps: u32,
    /// Ceiling for a whole run; a workflow may only ask for less.
    pub workflow_timeout_ms: u64,
    /// Used for steps that do not declare their own timeout.
    pub step_timeout_ms: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_db_queries: 100,
            max_api_calls: 10,
            max_emails: 10,
            max_steps: 100,
            workflow_timeout_ms: 300_000,
            step_timeout_ms: 30_000,
        }
    }
}

impl ExecutionLimits {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_millis(self.workflow_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Only read by the `sqlite` backend.
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            database_url: "sqlite://dagflow.db".to_owned(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: ExecutionLimits,
    pub persistence: PersistenceConfig,
    /// Buffered events per subscriber before slow ones start lagging.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            persistence: PersistenceConfig::default(),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }
}
