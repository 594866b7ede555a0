//! Workflow execution engine.
//!
//! `WorkflowExecutor` drives one run of a workflow:
//! 1. Builds in-degree and dependents maps straight from `depends_on`.
//! 2. Launches every ready step as its own task, up to `max_concurrent`.
//! 3. Wakes as soon as *any* running step finishes, records it and releases
//!    its dependents, so a step starts the moment its own dependencies are
//!    done rather than when its whole depth level is.
//! 4. Charges the run's budget and resolves `$name` params before dispatch.
//! 5. Applies each step's `on_error` policy; `retry` backs off exponentially.
//! 6. Bounds the walk by the workflow timeout and honours cancellation.
//! 7. Reports progress to the execution store. Store failures are logged
//!    and never abort the run.
//!
//! The coordinating loop is the only owner of the in-degree map, the ready
//! set, the results map and the budget, so none of them needs a lock.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use db::{ExecutionStatus, ExecutionStore};
use nodes::{ExecutionContext, NodeError, StepHandler};

use crate::budget::{BudgetCounter, BudgetExceeded, ExecutionBudget};
use crate::config::ExecutionLimits;
use crate::error::StepError;
use crate::events::{EventBus, ExecutionEvent};
use crate::log::{ErrorKind, ExecutionError, ExecutionLog, StepResult};
use crate::models::{short_id, ErrorStrategy, Step, StepType, Workflow};
use crate::params::{guard_passes, resolve_params};
use crate::registry::StepRegistry;

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Shared handle on one run. The coordinator writes the log; anyone holding
/// a clone may read it or cancel the run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub(crate) execution_id: String,
    pub(crate) log: Arc<Mutex<ExecutionLog>>,
    pub(crate) cancel: CancellationToken,
}

impl RunHandle {
    /// A fresh run, already RUNNING, with a new `exec_` id.
    pub(crate) fn new(
        workflow: &Workflow,
        ctx: &ExecutionContext,
        user_uid: Option<String>,
    ) -> Self {
        let execution_id = format!("exec_{}", short_id());
        let mut log = ExecutionLog::new(
            execution_id.clone(),
            workflow.uid.clone(),
            user_uid,
            ctx.snapshot(),
        );
        log.workflow_version = workflow.version;
        log.transition(ExecutionStatus::Running);

        Self {
            execution_id,
            log: Arc::new(Mutex::new(log)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub async fn snapshot(&self) -> ExecutionLog {
        self.log.lock().await.clone()
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.log.lock().await.status
    }

    /// RUNNING -> CANCELLED, then interrupt in-flight steps.
    /// Returns `false` if the run was not running.
    pub async fn cancel(&self) -> bool {
        let cancelled = {
            let mut log = self.log.lock().await;
            log.status == ExecutionStatus::Running
                && log.finish(
                    ExecutionStatus::Cancelled,
                    Some(ExecutionError::new(ErrorKind::Cancelled, "execution was cancelled")),
                )
        };
        if cancelled {
            self.cancel.cancel();
        }
        cancelled
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Runs workflows against a handler registry under fixed limits.
///
/// Cheap to clone; clones share the registry, store and event bus.
#[derive(Clone)]
pub struct WorkflowExecutor {
    registry: Arc<StepRegistry>,
    limits: ExecutionLimits,
    store: Option<Arc<dyn ExecutionStore>>,
    events: EventBus,
}

impl WorkflowExecutor {
    pub fn new(registry: StepRegistry, limits: ExecutionLimits) -> Self {
        Self {
            registry: Arc::new(registry),
            limits,
            store: None,
            events: EventBus::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `workflow` to a terminal status and return its log.
    ///
    /// The graph is not validated here; unresolvable dependencies end the
    /// run with an `internal` error. Use [`crate::WorkflowEngine::submit`]
    /// for validated, cancellable background runs.
    #[instrument(skip_all, fields(workflow_uid = %workflow.uid))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        ctx: ExecutionContext,
        user_uid: Option<String>,
    ) -> ExecutionLog {
        let handle = RunHandle::new(workflow, &ctx, user_uid);
        self.drive(workflow, ctx, handle).await
    }

    pub(crate) async fn drive(
        &self,
        workflow: &Workflow,
        ctx: ExecutionContext,
        handle: RunHandle,
    ) -> ExecutionLog {
        let ctx = ctx.with_cancellation(handle.cancel.clone());
        for (key, value) in &workflow.variables {
            if ctx.get(key).is_none() {
                ctx.set_state(key.clone(), value.clone());
            }
        }

        info!(
            execution_id = %handle.execution_id,
            workflow_uid = %workflow.uid,
            steps = workflow.steps.len(),
            "execution started"
        );
        self.persist(&handle.snapshot().await).await;
        self.events.publish(ExecutionEvent::RunStarted {
            execution_id: handle.execution_id.clone(),
            workflow_uid: workflow.uid.clone(),
        });

        let mut results = HashMap::new();
        let outcome = self.walk(workflow, &ctx, &handle, &mut results).await;

        let finished = {
            let mut log = handle.log.lock().await;
            log.output = results.into_iter().collect();
            match outcome {
                Ok(()) => log.finish(ExecutionStatus::Completed, None),
                Err(failure) => {
                    let status = failure.status();
                    log.finish(status, Some(failure.into_error()))
                }
            };
            log.clone()
        };

        match finished.status {
            ExecutionStatus::Completed => {
                info!(execution_id = %finished.execution_id, "execution completed")
            }
            ExecutionStatus::Cancelled => {
                warn!(execution_id = %finished.execution_id, "execution cancelled")
            }
            status => error!(
                execution_id = %finished.execution_id,
                %status,
                error = ?finished.error,
                "execution failed"
            ),
        }

        self.persist_final(&finished).await;
        self.events.publish(ExecutionEvent::RunFinished {
            execution_id: finished.execution_id.clone(),
            status: finished.status,
            error: finished.error.clone(),
        });
        finished
    }

    // -----------------------------------------------------------------------
    // Internal: the scheduling loop.
    // -----------------------------------------------------------------------

    async fn walk(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        handle: &RunHandle,
        results: &mut HashMap<String, Value>,
    ) -> Result<(), RunFailure> {
        let steps: HashMap<&str, &Step> = workflow
            .steps
            .iter()
            .map(|s| (s.uid.as_str(), s))
            .collect();

        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &workflow.steps {
            let deps: BTreeSet<&str> = step.depends_on.iter().map(String::as_str).collect();
            in_degree.insert(step.uid.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(step.uid.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&uid, _)| uid)
            .collect();

        let cap = workflow.max_concurrent.filter(|&n| n > 0).unwrap_or(usize::MAX);
        let timeout = self.workflow_timeout(workflow);
        let deadline = Instant::now() + timeout;
        let mut budget = ExecutionBudget::new(&self.limits);
        // Dropping the set aborts whatever is still running.
        let mut running: JoinSet<StepOutcome> = JoinSet::new();
        let mut completed = 0usize;

        debug!(steps = steps.len(), ready = ready.len(), "dependency graph built");

        while completed < steps.len() {
            // Launch everything ready, up to the concurrency cap.
            while running.len() < cap {
                let Some(uid) = ready.pop_first() else { break };
                if handle.cancel.is_cancelled() {
                    return Err(RunFailure::Cancelled);
                }

                let step = steps[uid];
                match self.prepare(step, &mut budget, results, ctx) {
                    Prepared::Dispatch(task) => {
                        debug!(step_uid = uid, "launching step");
                        running.spawn(task.run());
                    }
                    Prepared::Skipped(reason) => {
                        info!(step_uid = uid, %reason, "step skipped");
                        self.record(handle, StepResult::skipped(step, reason.clone())).await;
                        self.events.publish(ExecutionEvent::StepSkipped {
                            execution_id: handle.execution_id.clone(),
                            step_uid: uid.to_owned(),
                            reason,
                        });
                        results.insert(uid.to_owned(), Value::Null);
                        ctx.set_result(uid, Value::Null);
                        completed += 1;
                        release(uid, &dependents, &mut in_degree, &mut ready);
                    }
                    Prepared::OverBudget(inputs, exceeded) => {
                        error!(step_uid = uid, %exceeded, "execution budget exceeded");
                        let rejected = StepResult::rejected(step, inputs, exceeded.to_string());
                        self.record(handle, rejected).await;
                        return Err(RunFailure::Budget {
                            step_uid: uid.to_owned(),
                            exceeded,
                        });
                    }
                }
            }

            if running.is_empty() {
                if ready.is_empty() && completed < steps.len() {
                    return Err(RunFailure::Internal(format!(
                        "scheduler stalled: {} of {} steps can never become ready",
                        steps.len() - completed,
                        steps.len()
                    )));
                }
                continue;
            }

            // Wait for the first task to finish, not for all of them.
            let joined = tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return Err(RunFailure::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(RunFailure::Timeout(timeout)),
                joined = running.join_next() => joined,
            };
            let Some(first) = joined else { continue };

            // Settle everything that has finished by now in uid order, so
            // simultaneous completions are recorded deterministically.
            let mut batch = vec![first];
            while let Some(joined) = running.try_join_next() {
                batch.push(joined);
            }
            let mut outcomes = Vec::with_capacity(batch.len());
            for joined in batch {
                outcomes.push(joined.map_err(|e| {
                    RunFailure::Internal(format!("step task failed to join: {e}"))
                })?);
            }
            outcomes.sort_by(|a, b| a.step_uid.cmp(&b.step_uid));

            let mut fatal = None;
            for outcome in outcomes {
                let Some(&step) = steps.get(outcome.step_uid.as_str()) else {
                    return Err(RunFailure::Internal(format!(
                        "finished task for unknown step '{}'",
                        outcome.step_uid
                    )));
                };
                match self.settle(step, outcome, handle, ctx, results).await {
                    Some(failure) => {
                        fatal.get_or_insert(failure);
                    }
                    None => {
                        completed += 1;
                        release(step.uid.as_str(), &dependents, &mut in_degree, &mut ready);
                    }
                }
            }
            if let Some(failure) = fatal {
                return Err(failure);
            }
        }

        debug!(
            steps = budget.used(BudgetCounter::StepsExecuted),
            db_queries = budget.used(BudgetCounter::DbQueries),
            api_calls = budget.used(BudgetCounter::ApiCalls),
            emails = budget.used(BudgetCounter::EmailsSent),
            "walk finished"
        );
        Ok(())
    }

    /// Budget, guard and param resolution for one ready step.
    fn prepare(
        &self,
        step: &Step,
        budget: &mut ExecutionBudget,
        results: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Prepared {
        if let Err(exceeded) = budget.charge(BudgetCounter::StepsExecuted) {
            return Prepared::OverBudget(Map::new(), exceeded);
        }

        if let Some(guard) = &step.only_when {
            if !guard_passes(guard, results, ctx) {
                return Prepared::Skipped(format!("guard '{guard}' is false"));
            }
        }

        let inputs = resolve_params(&step.params, results, ctx);
        if let Some(counter) = BudgetCounter::for_step(step.step_type) {
            if let Err(exceeded) = budget.charge(counter) {
                return Prepared::OverBudget(inputs, exceeded);
            }
        }

        Prepared::Dispatch(StepTask {
            uid: step.uid.clone(),
            kind: step.step_type,
            handler: self.registry.get(step.step_type),
            params: inputs,
            ctx: ctx.clone(),
            timeout: self.step_timeout(step),
            max_attempts: step.max_attempts(),
            retry_delay: Duration::from_millis(step.retry_delay_ms),
        })
    }

    /// Record a finished step and apply its error policy. Returns the
    /// failure that ends the run, if any.
    async fn settle(
        &self,
        step: &Step,
        outcome: StepOutcome,
        handle: &RunHandle,
        ctx: &ExecutionContext,
        results: &mut HashMap<String, Value>,
    ) -> Option<RunFailure> {
        let duration_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX);
        let mut record = StepResult {
            step_uid: step.uid.clone(),
            step_type: step.step_type,
            started_at: outcome.started_at,
            completed_at: Utc::now(),
            duration_ms,
            inputs: outcome.inputs,
            result: None,
            error: None,
            skipped: false,
            skip_reason: None,
            attempts: outcome.attempts,
        };

        let value = match outcome.result {
            Ok(value) => {
                info!(step_uid = %step.uid, duration_ms, "step completed");
                self.events.publish(ExecutionEvent::StepCompleted {
                    execution_id: handle.execution_id.clone(),
                    step_uid: step.uid.clone(),
                    duration_ms,
                });
                value
            }
            Err(err) => {
                let message = err.to_string();
                let continued = step.on_error == ErrorStrategy::Continue;
                record.error = Some(message.clone());
                self.events.publish(ExecutionEvent::StepFailed {
                    execution_id: handle.execution_id.clone(),
                    step_uid: step.uid.clone(),
                    error: message.clone(),
                    continued,
                });

                if !continued {
                    error!(
                        step_uid = %step.uid,
                        attempts = outcome.attempts,
                        error = %message,
                        "step failed"
                    );
                    self.record(handle, record).await;
                    return Some(RunFailure::Step {
                        step_uid: step.uid.clone(),
                        message,
                    });
                }

                warn!(step_uid = %step.uid, error = %message, "step failed, continuing");
                json!({ "error": message })
            }
        };

        record.result = Some(value.clone());
        self.record(handle, record).await;
        ctx.set_result(step.uid.clone(), value.clone());
        results.insert(step.uid.clone(), value);
        None
    }

    fn workflow_timeout(&self, workflow: &Workflow) -> Duration {
        let ceiling = self.limits.workflow_timeout();
        workflow
            .timeout_ms
            .map(Duration::from_millis)
            .map_or(ceiling, |t| t.min(ceiling))
    }

    fn step_timeout(&self, step: &Step) -> Duration {
        step.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.limits.step_timeout())
    }

    // -----------------------------------------------------------------------
    // Internal: persistence. Failures are logged, never propagated.
    // -----------------------------------------------------------------------

    async fn record(&self, handle: &RunHandle, result: StepResult) {
        let entry = serde_json::to_value(&result);
        handle.log.lock().await.steps.push(result);

        let Some(store) = &self.store else { return };
        let outcome = match entry {
            Ok(entry) => store.append_step_log(&handle.execution_id, entry).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => warn!(
                execution_id = %handle.execution_id,
                "execution record missing, step log not persisted"
            ),
            Err(e) => warn!(
                execution_id = %handle.execution_id,
                error = %e,
                "failed to persist step log"
            ),
        }
    }

    async fn persist(&self, log: &ExecutionLog) {
        let Some(store) = &self.store else { return };
        let outcome = match log.to_record() {
            Ok(record) => store.save(&record).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            warn!(execution_id = %log.execution_id, error = %e, "failed to persist execution");
        }
    }

    async fn persist_final(&self, log: &ExecutionLog) {
        let Some(store) = &self.store else { return };
        let error = log.error.as_ref().and_then(|e| serde_json::to_value(e).ok());
        if let Err(e) = store
            .update_status(&log.execution_id, log.status, error, log.completed_at)
            .await
        {
            warn!(
                execution_id = %log.execution_id,
                error = %e,
                "failed to update execution status"
            );
        }
        self.persist(log).await;
    }
}

/// Decrement the in-degree of every dependent of `uid`; newly ready ones
/// join the ready set.
fn release<'a>(
    uid: &str,
    dependents: &HashMap<&'a str, Vec<&'a str>>,
    in_degree: &mut HashMap<&'a str, usize>,
    ready: &mut BTreeSet<&'a str>,
) {
    for &next in dependents.get(uid).map(Vec::as_slice).unwrap_or_default() {
        if let Some(deg) = in_degree.get_mut(next) {
            *deg -= 1;
            if *deg == 0 {
                ready.insert(next);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Step tasks
// ---------------------------------------------------------------------------

enum Prepared {
    Dispatch(StepTask),
    Skipped(String),
    OverBudget(Map<String, Value>, BudgetExceeded),
}

/// Everything a spawned step needs; owns its data so it can outlive the
/// coordinator's borrows.
struct StepTask {
    uid: String,
    kind: StepType,
    handler: Option<Arc<dyn StepHandler>>,
    params: Map<String, Value>,
    ctx: ExecutionContext,
    timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
}

struct StepOutcome {
    step_uid: String,
    started_at: DateTime<Utc>,
    elapsed: Duration,
    inputs: Map<String, Value>,
    attempts: u32,
    result: Result<Value, StepError>,
}

impl StepTask {
    async fn run(self) -> StepOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempts = 0;

        let result = loop {
            attempts += 1;
            match self.attempt().await {
                Ok(value) => break Ok(value),
                Err(err) if attempts < self.max_attempts => {
                    let delay = self
                        .retry_delay
                        .saturating_mul(2u32.saturating_pow(attempts - 1));
                    warn!(
                        step_uid = %self.uid,
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        ?delay,
                        error = %err,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        StepOutcome {
            step_uid: self.uid,
            started_at,
            elapsed: clock.elapsed(),
            inputs: self.params,
            attempts,
            result,
        }
    }

    /// One handler call under the step timeout. A panic counts as a failure.
    async fn attempt(&self) -> Result<Value, StepError> {
        let Some(handler) = &self.handler else {
            return Err(NodeError::NotImplemented(self.kind.to_string()).into());
        };

        let call = AssertUnwindSafe(handler.handle(self.params.clone(), &self.ctx)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result.map_err(StepError::from),
            Ok(Err(panic)) => Err(StepError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(StepError::TimedOut(self.timeout)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

// ---------------------------------------------------------------------------
// Run failures
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum RunFailure {
    Budget {
        step_uid: String,
        exceeded: BudgetExceeded,
    },
    Step {
        step_uid: String,
        message: String,
    },
    Timeout(Duration),
    Cancelled,
    Internal(String),
}

impl RunFailure {
    fn status(&self) -> ExecutionStatus {
        match self {
            Self::Timeout(_) => ExecutionStatus::Timeout,
            Self::Cancelled => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failed,
        }
    }

    fn into_error(self) -> ExecutionError {
        match self {
            Self::Budget { step_uid, exceeded } => {
                ExecutionError::new(ErrorKind::BudgetExceeded, exceeded.to_string())
                    .at_step(step_uid)
            }
            Self::Step { step_uid, message } => {
                ExecutionError::new(ErrorKind::StepFailed, message).at_step(step_uid)
            }
            Self::Timeout(limit) => ExecutionError::new(
                ErrorKind::Timeout,
                format!("workflow exceeded its timeout of {}ms", limit.as_millis()),
            ),
            Self::Cancelled => ExecutionError::new(ErrorKind::Cancelled, "execution was cancelled"),
            Self::Internal(message) => ExecutionError::new(ErrorKind::Internal, message),
        }
    }
}
