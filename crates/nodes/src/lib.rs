//! `nodes` crate: the `StepHandler` trait, the execution context, and the
//! built-in step handlers.
//!
//! Every handler, built-in or registered, must implement
//! [`StepHandler`]. The engine crate dispatches execution through this trait
//! object.

pub mod builtin;
pub mod context;
pub mod error;
pub mod mock;
pub mod traits;

pub use context::ExecutionContext;
pub use error::NodeError;
pub use traits::StepHandler;
