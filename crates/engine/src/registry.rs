//! Step handler registry: maps each [`StepType`] to the handler that runs it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use nodes::StepHandler;
use nodes::builtin::{LogStep, SetExecutionStateStep};

use crate::models::{StepType, Workflow};

#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    /// An empty registry. Every step kind will fail as not implemented.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the in-process handlers (`log`, `set_execution_state`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StepType::Log, LogStep);
        registry.register(StepType::SetExecutionState, SetExecutionStateStep);
        registry
    }

    /// Register `handler` for `kind`, replacing any earlier one.
    pub fn register(&mut self, kind: StepType, handler: impl StepHandler + 'static) -> &mut Self {
        self.register_arc(kind, Arc::new(handler))
    }

    /// Register a shared handler; the same instance may serve several kinds.
    pub fn register_arc(&mut self, kind: StepType, handler: Arc<dyn StepHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: StepType) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepType) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Kinds used by `workflow` that have no handler, sorted.
    pub fn missing_for(&self, workflow: &Workflow) -> Vec<StepType> {
        workflow
            .steps
            .iter()
            .map(|s| s.step_type)
            .filter(|kind| !self.contains(*kind))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: BTreeSet<_> = self.handlers.keys().collect();
        f.debug_struct("StepRegistry").field("kinds", &kinds).finish()
    }
}
