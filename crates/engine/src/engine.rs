//! `WorkflowEngine`: background submission, cancellation, queries and retry
//! on top of [`WorkflowExecutor`].
//!
//! `submit` validates the workflow, registers the run and returns its id
//! straight away; the run itself proceeds on its own task. In-flight runs are
//! answered from memory. With an execution store, a finished run leaves
//! memory once its final record is stored and is answered from the store.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn, Instrument};

use db::{ExecutionStore, WorkflowRecord, WorkflowStore};
use nodes::ExecutionContext;

use crate::compiler;
use crate::config::EngineConfig;
use crate::error::{CompilationError, EngineError};
use crate::events::{EventBus, ExecutionEvent};
use crate::executor::{RunHandle, WorkflowExecutor};
use crate::graph::{ExecutionPlan, ValidationResult};
use crate::log::ExecutionLog;
use crate::models::Workflow;
use crate::registry::StepRegistry;

#[derive(Clone)]
struct ActiveRun {
    handle: RunHandle,
    /// Flips to `true` once the coordinator has finished.
    done: watch::Receiver<bool>,
}

pub struct WorkflowEngine {
    executor: WorkflowExecutor,
    runs: Arc<DashMap<String, ActiveRun>>,
    executions: Option<Arc<dyn ExecutionStore>>,
    workflows: Option<Arc<dyn WorkflowStore>>,
}

impl WorkflowEngine {
    pub fn new(config: &EngineConfig, registry: StepRegistry) -> Self {
        let executor = WorkflowExecutor::new(registry, config.limits.clone())
            .with_events(EventBus::new(config.event_capacity));
        Self {
            executor,
            runs: Arc::new(DashMap::new()),
            executions: None,
            workflows: None,
        }
    }

    /// Persist every run's log through `store`.
    pub fn with_execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.executor = self.executor.with_store(Arc::clone(&store));
        self.executions = Some(store);
        self
    }

    /// Keep submitted definitions so finished runs can be retried.
    pub fn with_workflow_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.workflows = Some(store);
        self
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.executor.events().subscribe()
    }

    pub fn validate(&self, workflow: &Workflow) -> ValidationResult {
        compiler::validate(&workflow.to_graph())
    }

    pub fn compile(&self, workflow: &Workflow) -> Result<ExecutionPlan, CompilationError> {
        compiler::compile(&workflow.to_graph())
    }

    /// Validate `workflow` and start running it in the background.
    ///
    /// # Errors
    /// [`EngineError::Compilation`] if the graph has a blocking issue. Nothing
    /// runs in that case.
    #[instrument(skip_all, fields(workflow_uid = %workflow.uid))]
    pub async fn submit(
        &self,
        workflow: Workflow,
        ctx: ExecutionContext,
        user_uid: Option<String>,
    ) -> Result<String, EngineError> {
        let plan = compiler::compile(&workflow.to_graph())?;
        for issue in plan.validation.warnings() {
            warn!(code = %issue.code, "{}", issue.message);
        }
        let missing = self.executor.registry().missing_for(&workflow);
        if !missing.is_empty() {
            warn!(?missing, "no handler registered; these steps will fail when reached");
        }

        self.save_definition(&workflow).await;

        let handle = RunHandle::new(&workflow, &ctx, user_uid);
        let execution_id = handle.execution_id().to_owned();
        let (done_tx, done_rx) = watch::channel(false);
        self.runs.insert(
            execution_id.clone(),
            ActiveRun {
                handle: handle.clone(),
                done: done_rx,
            },
        );

        let executor = self.executor.clone();
        let runs = Arc::clone(&self.runs);
        let store = self.executions.clone();
        tokio::spawn(
            async move {
                let log = executor.drive(&workflow, ctx, handle).await;
                if let Some(store) = store {
                    if final_record_stored(store.as_ref(), &log).await {
                        runs.remove(&log.execution_id);
                    }
                }
                let _ = done_tx.send(true);
            }
            .in_current_span(),
        );

        info!(%execution_id, "workflow submitted");
        Ok(execution_id)
    }

    /// Cancel a running execution. `true` only if it was RUNNING.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let Some(handle) = self.runs.get(execution_id).map(|r| r.handle.clone()) else {
            debug!("no in-flight run with this id");
            return false;
        };
        let cancelled = handle.cancel().await;
        if cancelled {
            info!("execution cancelled");
        }
        cancelled
    }

    /// Current log of an execution, or `None` if no one knows it.
    pub async fn query(&self, execution_id: &str) -> Result<Option<ExecutionLog>, EngineError> {
        let handle = self.runs.get(execution_id).map(|r| r.handle.clone());
        if let Some(handle) = handle {
            return Ok(Some(handle.snapshot().await));
        }

        let Some(store) = &self.executions else {
            return Ok(None);
        };
        match store.get(execution_id).await? {
            Some(record) => Ok(Some(ExecutionLog::try_from(record)?)),
            None => Ok(None),
        }
    }

    /// Wait until the run's coordinator is done, then return the final log.
    pub async fn wait(&self, execution_id: &str) -> Result<Option<ExecutionLog>, EngineError> {
        let run = self.runs.get(execution_id).map(|r| r.value().clone());
        let Some(ActiveRun { handle, mut done }) = run else {
            return self.query(execution_id).await;
        };

        // An error means the coordinator task is gone; its log is final.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(Some(handle.snapshot().await))
    }

    /// Re-run a finished execution under a new id, with the definition
    /// version it originally ran and a context rebuilt from its input snapshot.
    ///
    /// # Errors
    /// [`EngineError::RetryUnsupported`] when no workflow store is configured,
    /// [`EngineError::WorkflowNotFound`] when that version is no longer stored.
    #[instrument(skip(self))]
    pub async fn retry(&self, execution_id: &str) -> Result<String, EngineError> {
        let original = self
            .query(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_owned()))?;

        let Some(store) = &self.workflows else {
            return Err(EngineError::RetryUnsupported(execution_id.to_owned()));
        };
        if !original.status.is_terminal() {
            return Err(EngineError::NotRetryable {
                execution_id: execution_id.to_owned(),
                status: original.status,
            });
        }

        let record = store
            .get_workflow(&original.workflow_uid, original.workflow_version)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound {
                uid: original.workflow_uid.clone(),
                version: original.workflow_version,
            })?;
        let workflow: Workflow = serde_json::from_value(record.definition)?;
        let ctx = ExecutionContext::from_snapshot(&original.input_snapshot);

        info!(workflow_uid = %workflow.uid, "retrying execution");
        self.submit(workflow, ctx, original.user_uid).await
    }

    async fn save_definition(&self, workflow: &Workflow) {
        let Some(store) = &self.workflows else { return };
        let definition = match serde_json::to_value(workflow) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(error = %e, "failed to serialize workflow definition");
                return;
            }
        };
        let record = WorkflowRecord {
            uid: workflow.uid.clone(),
            version: workflow.version,
            definition,
            saved_at: Utc::now(),
        };
        if let Err(e) = store.save_workflow(&record).await {
            warn!(error = %e, "failed to store workflow definition");
        }
    }
}

/// Whether the store already holds `log`'s terminal state.
async fn final_record_stored(store: &dyn ExecutionStore, log: &ExecutionLog) -> bool {
    match store.get(&log.execution_id).await {
        Ok(Some(record)) => record.status == log.status,
        Ok(None) => false,
        Err(e) => {
            debug!(execution_id = %log.execution_id, error = %e, "keeping run in memory");
            false
        }
    }
}
