//! Step-handler error type.

use thiserror::Error;

/// Errors returned by a handler's `handle` method.
///
/// Every variant is a step failure as far as the scheduler is concerned; the
/// step's `on_error` policy decides what happens next.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The handler ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// A parameter the handler needs is missing or has the wrong shape.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    /// No handler is registered for this step type.
    #[error("no handler registered for step type '{0}'")]
    NotImplemented(String),
}

impl NodeError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
