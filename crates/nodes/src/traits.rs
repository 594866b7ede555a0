//! The `StepHandler` trait, the contract every step kind must fulfil.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{ExecutionContext, NodeError};

/// The core handler trait.
///
/// The executor resolves `$name` references before calling `handle`, so
/// `params` only ever contains concrete values.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run one step and return its output.
    ///
    /// A handler may suspend on I/O; the executor enforces the step timeout
    /// and may drop the future at any suspension point when the run is
    /// cancelled or times out.
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError>;
}
