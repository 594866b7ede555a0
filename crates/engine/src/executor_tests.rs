//! Scenario tests for the executor and the engine built on it.
//!
//! Handlers come from `nodes::mock`: `ScriptedStep` (registered for
//! `transform_data`) reads its behaviour from each step's params, so one
//! registration drives many differently-behaving steps. Timing tests run on
//! tokio's paused clock, where sleeps auto-advance and durations are exact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use db::{
    DbError, ExecutionRecord, ExecutionStore, InMemoryExecutionStore, InMemoryWorkflowStore,
    WorkflowStore,
};
use nodes::mock::{MockStep, ScriptedStep};
use nodes::{ExecutionContext, NodeError, StepHandler};

use crate::{
    EngineConfig, EngineError, ErrorKind, ErrorStrategy, ExecutionEvent, ExecutionLimits,
    ExecutionLog, ExecutionStatus, IssueCode, Step, StepRegistry, StepType, Trigger,
    WorkflowEngine, WorkflowExecutor, Workflow,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn workflow(steps: Vec<Step>) -> Workflow {
    Workflow::new("scenario", Trigger::Manual, steps)
}

fn scripted(uid: &str) -> Step {
    Step::new(uid, StepType::TransformData).param("label", json!(uid))
}

fn sleeping(uid: &str, ms: u64) -> Step {
    scripted(uid).param("delay_ms", json!(ms))
}

fn failing(uid: &str, msg: &str) -> Step {
    scripted(uid).param("fail", json!(msg))
}

fn log_step(uid: &str) -> Step {
    Step::new(uid, StepType::Log).param("message", json!(uid))
}

fn registry_with(script: &ScriptedStep) -> StepRegistry {
    let mut registry = StepRegistry::with_builtins();
    registry.register(StepType::TransformData, script.clone());
    registry
}

fn executor_with(script: &ScriptedStep) -> WorkflowExecutor {
    WorkflowExecutor::new(registry_with(script), ExecutionLimits::default())
}

fn engine_with(script: &ScriptedStep) -> WorkflowEngine {
    WorkflowEngine::new(&EngineConfig::default(), registry_with(script))
}

fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn run(executor: &WorkflowExecutor, wf: &Workflow) -> ExecutionLog {
    executor.execute(wf, ExecutionContext::new(), None).await
}

// ============================================================
// Scheduling
// ============================================================

#[tokio::test]
async fn instant_steps_complete_in_the_same_order_every_run() {
    let executor = WorkflowExecutor::new(StepRegistry::with_builtins(), ExecutionLimits::default());
    let wf = workflow(vec![
        log_step("step_4").depends_on(["step_2", "step_3"]),
        log_step("step_2").depends_on(["step_1"]),
        log_step("step_3").depends_on(["step_1"]),
        log_step("step_1"),
    ]);

    let mut orders = Vec::new();
    for _ in 0..5 {
        let log = run(&executor, &wf).await;
        assert_eq!(log.status, ExecutionStatus::Completed);
        orders.push(log.step_order().into_iter().map(str::to_owned).collect::<Vec<_>>());
    }

    assert!(orders.windows(2).all(|pair| pair[0] == pair[1]));
    let order = &orders[0];
    let pos = |uid: &str| order.iter().position(|s| s == uid).unwrap();
    assert!(pos("step_1") < pos("step_2") && pos("step_1") < pos("step_3"));
    assert!(pos("step_2") < pos("step_4") && pos("step_3") < pos("step_4"));
}

#[tokio::test(start_paused = true)]
async fn dependents_start_as_soon_as_their_own_dependencies_finish() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let wf = workflow(vec![
        sleeping("a", 100),
        sleeping("b", 2_000),
        sleeping("c", 1_000).depends_on(["a"]),
    ]);

    let started = Instant::now();
    let log = run(&executor, &wf).await;
    let elapsed = started.elapsed();

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert!(elapsed >= Duration::from_millis(2_000));
    assert!(elapsed < Duration::from_millis(2_500), "took {elapsed:?}");
    assert_eq!(log.step_order(), vec!["a", "c", "b"]);
}

#[tokio::test(start_paused = true)]
async fn max_concurrent_caps_running_steps() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let mut wf = workflow(vec![sleeping("a", 100), sleeping("b", 100), sleeping("c", 100)]);
    wf.max_concurrent = Some(1);

    let started = Instant::now();
    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(log.step_order(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn unresolvable_dependency_is_an_internal_error() {
    let executor = WorkflowExecutor::new(StepRegistry::with_builtins(), ExecutionLimits::default());
    let wf = workflow(vec![log_step("a"), log_step("b").depends_on(["ghost"])]);

    let log = run(&executor, &wf).await;
    assert_eq!(log.status, ExecutionStatus::Failed);
    assert_eq!(log.error.as_ref().unwrap().kind, ErrorKind::Internal);
    assert!(log.step("a").unwrap().succeeded());
    assert!(log.step("b").is_none());
}

#[tokio::test]
async fn empty_workflow_completes_immediately() {
    let executor = WorkflowExecutor::new(StepRegistry::new(), ExecutionLimits::default());
    let log = run(&executor, &workflow(vec![])).await;
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert!(log.steps.is_empty());
    assert!(log.completed_at.is_some());
}

// ============================================================
// Budget
// ============================================================

fn api_executor(api: &MockStep, max_api_calls: u32) -> WorkflowExecutor {
    let mut registry = StepRegistry::with_builtins();
    registry.register(StepType::ApiCall, api.clone());
    let limits = ExecutionLimits {
        max_api_calls,
        ..ExecutionLimits::default()
    };
    WorkflowExecutor::new(registry, limits)
}

#[tokio::test]
async fn exceeding_the_api_budget_fails_the_run_before_the_next_call() {
    let api = MockStep::returning("api", json!({ "ok": true }));
    let executor = api_executor(&api, 2);
    let wf = workflow(vec![
        Step::new("call_1", StepType::ApiCall),
        Step::new("call_2", StepType::ApiCall).depends_on(["call_1"]),
        Step::new("call_3", StepType::ApiCall).depends_on(["call_2"]),
        Step::new("call_4", StepType::ApiCall).depends_on(["call_3"]),
    ]);

    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Failed);
    let error = log.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::BudgetExceeded);
    assert_eq!(error.step_uid.as_deref(), Some("call_3"));
    assert_eq!(error.message, "too many API calls (max: 2)");
    assert_eq!(api.call_count(), 2);
    assert!(log.step("call_3").unwrap().error.is_some());
    assert!(log.step("call_4").is_none());
}

#[tokio::test]
async fn budget_is_fatal_even_under_continue() {
    let api = MockStep::returning("api", json!({}));
    let executor = api_executor(&api, 1);
    let wf = workflow(vec![
        Step::new("a", StepType::ApiCall).on_error(ErrorStrategy::Continue),
        Step::new("b", StepType::ApiCall).on_error(ErrorStrategy::Continue),
        Step::new("c", StepType::ApiCall).on_error(ErrorStrategy::Continue),
    ]);

    let log = run(&executor, &wf).await;
    assert_eq!(log.status, ExecutionStatus::Failed);
    assert_eq!(log.error.as_ref().unwrap().kind, ErrorKind::BudgetExceeded);
    assert!(api.call_count() <= 1);
}

// ============================================================
// Error policies
// ============================================================

#[tokio::test]
async fn continue_policy_hands_the_error_downstream() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let wf = workflow(vec![
        failing("flaky", "upstream broke").on_error(ErrorStrategy::Continue),
        scripted("consumer")
            .param("upstream", json!("$flaky"))
            .depends_on(["flaky"]),
    ]);

    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    let flaky = log.step("flaky").unwrap();
    assert_eq!(flaky.error.as_deref(), Some("upstream broke"));
    assert_eq!(log.output["flaky"], json!({ "error": "upstream broke" }));

    let consumer = log.step("consumer").unwrap();
    assert!(consumer.succeeded());
    assert_eq!(consumer.inputs["upstream"], json!({ "error": "upstream broke" }));
}

#[tokio::test(start_paused = true)]
async fn stop_policy_aborts_the_run_and_its_siblings() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let wf = workflow(vec![
        sleeping("sibling", 5_000),
        failing("broken", "boom"),
        scripted("downstream").depends_on(["broken"]),
    ]);

    let started = Instant::now();
    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Failed);
    let error = log.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::StepFailed);
    assert_eq!(error.step_uid.as_deref(), Some("broken"));
    assert_eq!(error.message, "boom");
    assert!(log.step("sibling").is_none());
    assert!(log.step("downstream").is_none());
    assert!(!script.labels().contains(&"downstream".to_string()));
    assert!(started.elapsed() < Duration::from_millis(5_000));
}

#[tokio::test(start_paused = true)]
async fn step_timeout_is_a_step_failure_under_its_policy() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);

    let tolerant = workflow(vec![
        sleeping("slow", 5_000)
            .timeout(Duration::from_millis(50))
            .on_error(ErrorStrategy::Continue),
        scripted("next").depends_on(["slow"]),
    ]);
    let log = run(&executor, &tolerant).await;
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(
        log.step("slow").unwrap().error.as_deref(),
        Some("step timed out after 50ms")
    );
    assert!(log.step("next").unwrap().succeeded());

    let strict = workflow(vec![sleeping("slow", 5_000).timeout(Duration::from_millis(50))]);
    let log = run(&executor, &strict).await;
    assert_eq!(log.status, ExecutionStatus::Failed);
    assert_eq!(log.error.as_ref().unwrap().kind, ErrorKind::StepFailed);
}

#[tokio::test(start_paused = true)]
async fn retry_policy_backs_off_and_records_attempts() {
    let api = MockStep::flaky("api", 2, json!({ "ok": true }));
    let executor = api_executor(&api, 10);
    let wf = workflow(vec![
        Step::new("call", StepType::ApiCall).retry(2, Duration::from_millis(100))
    ]);

    let started = Instant::now();
    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.step("call").unwrap().attempts, 3);
    assert_eq!(api.call_count(), 3);
    // 100ms after the first failure, 200ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_like_stop() {
    let api = MockStep::flaky("api", 5, json!({}));
    let executor = api_executor(&api, 10);
    let wf = workflow(vec![
        Step::new("call", StepType::ApiCall).retry(1, Duration::from_millis(10))
    ]);

    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Failed);
    let call = log.step("call").unwrap();
    assert_eq!(call.attempts, 2);
    assert_eq!(call.error.as_deref(), Some("api transient failure #2"));
}

struct PanickingStep;

#[async_trait]
impl StepHandler for PanickingStep {
    async fn handle(
        &self,
        _params: Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        panic!("handler exploded");
    }
}

#[tokio::test]
async fn handler_panic_is_an_ordinary_step_failure() {
    let mut registry = StepRegistry::with_builtins();
    registry.register(StepType::PluginAction, PanickingStep);
    let executor = WorkflowExecutor::new(registry, ExecutionLimits::default());
    let wf = workflow(vec![
        Step::new("plugin", StepType::PluginAction).on_error(ErrorStrategy::Continue),
        log_step("after").depends_on(["plugin"]),
    ]);

    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(
        log.step("plugin").unwrap().error.as_deref(),
        Some("step handler panicked: handler exploded")
    );
    assert!(log.step("after").unwrap().succeeded());
}

#[tokio::test]
async fn unregistered_step_kind_fails_as_not_implemented() {
    let executor = WorkflowExecutor::new(StepRegistry::with_builtins(), ExecutionLimits::default());
    let wf = workflow(vec![Step::new("mail", StepType::SendEmail).param("to", json!("a@b.c"))]);

    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Failed);
    assert_eq!(
        log.error.as_ref().unwrap().message,
        "no handler registered for step type 'send_email'"
    );
}

// ============================================================
// Timeouts
// ============================================================

#[tokio::test(start_paused = true)]
async fn workflow_timeout_cancels_in_flight_steps() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let mut wf = workflow(vec![
        sleeping("quick", 10),
        sleeping("forever", 60_000).timeout(Duration::from_secs(120)),
    ]);
    wf.timeout_ms = Some(1_000);

    let started = Instant::now();
    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Timeout);
    assert_eq!(log.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert!(log.step("quick").unwrap().succeeded());
    assert!(log.step("forever").is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn workflow_timeout_never_exceeds_the_engine_ceiling() {
    let script = ScriptedStep::new();
    let limits = ExecutionLimits {
        workflow_timeout_ms: 500,
        ..ExecutionLimits::default()
    };
    let executor = WorkflowExecutor::new(registry_with(&script), limits);
    let mut wf = workflow(vec![sleeping("long", 5_000)]);
    wf.timeout_ms = Some(10_000);

    let started = Instant::now();
    let log = run(&executor, &wf).await;

    assert_eq!(log.status, ExecutionStatus::Timeout);
    assert!(started.elapsed() < Duration::from_millis(1_000));
}

// ============================================================
// Params, guards and context
// ============================================================

#[tokio::test]
async fn params_resolve_against_results_then_context() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let mut wf = workflow(vec![
        scripted("first").param("output", json!({ "n": 1 })),
        scripted("second")
            .depends_on(["first"])
            .param("from_step", json!("$first"))
            .param("from_vars", json!("$greeting"))
            .param("who", json!("$Current User")),
    ]);
    wf.variables = map(json!({ "greeting": "hello" }));
    let ctx = ExecutionContext::new().with_user(json!({ "uid": "u1" }));

    let log = executor.execute(&wf, ctx, Some("u1".into())).await;

    let second = log.step("second").unwrap();
    assert_eq!(second.inputs["from_step"], json!({ "n": 1 }));
    assert_eq!(second.inputs["from_vars"], json!("hello"));
    assert_eq!(second.inputs["who"], json!({ "uid": "u1" }));
    assert_eq!(log.user_uid.as_deref(), Some("u1"));
}

#[tokio::test]
async fn state_written_by_one_step_is_visible_to_later_ones() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let wf = workflow(vec![
        Step::new("remember", StepType::SetExecutionState)
            .param("name", json!("region"))
            .param("value", json!("eu")),
        scripted("use").depends_on(["remember"]).param("region", json!("$region")),
    ]);

    let log = run(&executor, &wf).await;
    assert_eq!(log.step("use").unwrap().inputs["region"], json!("eu"));
}

#[tokio::test]
async fn falsy_guard_skips_the_step_but_releases_dependents() {
    let script = ScriptedStep::new();
    let executor = executor_with(&script);
    let wf = workflow(vec![
        scripted("maybe").only_when("$notify"),
        scripted("after")
            .depends_on(["maybe"])
            .param("prev", json!("$maybe")),
    ]);
    let ctx = ExecutionContext::new().with_state(map(json!({ "notify": false })));

    let log = executor.execute(&wf, ctx, None).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    let maybe = log.step("maybe").unwrap();
    assert!(maybe.skipped);
    assert!(maybe.skip_reason.as_deref().unwrap().contains("$notify"));
    assert_eq!(log.output["maybe"], Value::Null);
    assert_eq!(log.step("after").unwrap().inputs["prev"], Value::Null);
    assert_eq!(script.labels(), vec!["after"]);
}

// ============================================================
// Persistence
// ============================================================

#[tokio::test]
async fn runs_are_persisted_with_their_step_logs() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let executor = WorkflowExecutor::new(StepRegistry::with_builtins(), ExecutionLimits::default())
        .with_store(store.clone());
    let wf = workflow(vec![log_step("a"), log_step("b").depends_on(["a"])]);

    let log = run(&executor, &wf).await;

    let record = store.get(&log.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.step_logs.len(), 2);
    assert_eq!(ExecutionLog::try_from(record).unwrap(), log);
}

/// A store whose every call fails.
struct BrokenStore;

fn broken() -> DbError {
    DbError::InvalidRow("disk on fire".into())
}

#[async_trait]
impl ExecutionStore for BrokenStore {
    async fn save(&self, _record: &ExecutionRecord) -> Result<(), DbError> {
        Err(broken())
    }

    async fn get(&self, _execution_id: &str) -> Result<Option<ExecutionRecord>, DbError> {
        Err(broken())
    }

    async fn delete(&self, _execution_id: &str) -> Result<bool, DbError> {
        Err(broken())
    }

    async fn list_by_status(
        &self,
        _status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        Err(broken())
    }

    async fn list_active(&self) -> Result<Vec<ExecutionRecord>, DbError> {
        Err(broken())
    }

    async fn update_status(
        &self,
        _execution_id: &str,
        _status: ExecutionStatus,
        _error: Option<Value>,
        _completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        Err(broken())
    }

    async fn append_step_log(
        &self,
        _execution_id: &str,
        _step_log: Value,
    ) -> Result<bool, DbError> {
        Err(broken())
    }

    async fn list_for_workflow(
        &self,
        _workflow_uid: &str,
        _limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        Err(broken())
    }

    async fn list_for_user(
        &self,
        _user_uid: &str,
        _limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        Err(broken())
    }
}

#[tokio::test]
async fn persistence_failures_do_not_abort_the_run() {
    let executor = WorkflowExecutor::new(StepRegistry::with_builtins(), ExecutionLimits::default())
        .with_store(Arc::new(BrokenStore));
    let wf = workflow(vec![log_step("a"), log_step("b").depends_on(["a"])]);

    let log = run(&executor, &wf).await;
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.steps.len(), 2);
}

// ============================================================
// Engine
// ============================================================

#[tokio::test(start_paused = true)]
async fn cancelling_keeps_finished_steps_and_launches_nothing_new() {
    let script = ScriptedStep::new();
    let engine = engine_with(&script);
    let wf = workflow(vec![
        sleeping("fast", 100),
        sleeping("slow", 10_000).depends_on(["fast"]),
        scripted("after").depends_on(["slow"]),
    ]);

    let id = engine
        .submit(wf, ExecutionContext::new(), Some("u1".into()))
        .await
        .unwrap();
    assert!(id.starts_with("exec_"));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(engine.cancel(&id).await);
    let log = engine.wait(&id).await.unwrap().unwrap();

    assert_eq!(log.status, ExecutionStatus::Cancelled);
    assert_eq!(log.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(log.step("fast").unwrap().succeeded());
    assert!(log.step("slow").is_none());
    assert!(log.step("after").is_none());
    assert_eq!(script.labels(), vec!["fast", "slow"]);
    assert!(!engine.cancel(&id).await);
}

#[tokio::test]
async fn submit_rejects_cyclic_workflows() {
    let engine = engine_with(&ScriptedStep::new());
    let wf = workflow(vec![
        log_step("a").depends_on(["b"]),
        log_step("b").depends_on(["a"]),
    ]);

    let err = engine
        .submit(wf, ExecutionContext::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Compilation(ref e) if e.code == IssueCode::Cycle));
}

#[tokio::test]
async fn unknown_executions_are_not_found() {
    let engine = engine_with(&ScriptedStep::new());
    assert!(engine.query("exec_missing").await.unwrap().is_none());
    assert!(engine.wait("exec_missing").await.unwrap().is_none());
    assert!(!engine.cancel("exec_missing").await);
    assert!(matches!(
        engine.retry("exec_missing").await,
        Err(EngineError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn retry_needs_workflow_storage() {
    let engine = engine_with(&ScriptedStep::new());
    let id = engine
        .submit(workflow(vec![failing("x", "nope")]), ExecutionContext::new(), None)
        .await
        .unwrap();
    engine.wait(&id).await.unwrap();

    let err = engine.retry(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::RetryUnsupported(_)));
    assert!(err.to_string().contains("not supported without workflow storage"));
}

#[tokio::test]
async fn retry_reruns_the_stored_definition_under_a_new_id() {
    let script = ScriptedStep::new();
    let engine = engine_with(&script)
        .with_execution_store(Arc::new(InMemoryExecutionStore::new()))
        .with_workflow_store(Arc::new(InMemoryWorkflowStore::new()));
    let wf = workflow(vec![scripted("echo").param("order", json!("$order"))]);
    let ctx = ExecutionContext::new().with_input(map(json!({ "order": 7 })));

    let first = engine.submit(wf, ctx, Some("u1".into())).await.unwrap();
    let first_log = engine.wait(&first).await.unwrap().unwrap();

    let second = engine.retry(&first).await.unwrap();
    assert_ne!(first, second);
    let second_log = engine.wait(&second).await.unwrap().unwrap();

    assert_eq!(second_log.status, ExecutionStatus::Completed);
    assert_eq!(second_log.workflow_uid, first_log.workflow_uid);
    assert_eq!(second_log.user_uid.as_deref(), Some("u1"));
    assert_eq!(second_log.step("echo").unwrap().inputs["order"], json!(7));
    assert_eq!(script.call_count(), 2);
}

#[tokio::test]
async fn retry_runs_the_definition_version_the_execution_used() {
    let script = ScriptedStep::new();
    let engine = engine_with(&script)
        .with_execution_store(Arc::new(InMemoryExecutionStore::new()))
        .with_workflow_store(Arc::new(InMemoryWorkflowStore::new()));
    let v1 = workflow(vec![scripted("original_step")]);
    let mut v2 = v1.clone();
    v2.version = 2;
    v2.steps = vec![scripted("replacement_step")];

    let first = engine.submit(v1, ExecutionContext::new(), None).await.unwrap();
    engine.wait(&first).await.unwrap();
    let second = engine.submit(v2, ExecutionContext::new(), None).await.unwrap();
    assert_eq!(engine.wait(&second).await.unwrap().unwrap().workflow_version, 2);

    let retried = engine.retry(&first).await.unwrap();
    let log = engine.wait(&retried).await.unwrap().unwrap();

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.workflow_version, 1);
    assert_eq!(log.step_order(), vec!["original_step"]);
    assert_eq!(
        script.labels(),
        vec!["original_step", "replacement_step", "original_step"]
    );
}

#[tokio::test]
async fn retry_fails_when_the_definition_version_is_gone() {
    let workflows = Arc::new(InMemoryWorkflowStore::new());
    let engine = engine_with(&ScriptedStep::new())
        .with_execution_store(Arc::new(InMemoryExecutionStore::new()))
        .with_workflow_store(workflows.clone());
    let wf = workflow(vec![log_step("a")]);
    let uid = wf.uid.clone();

    let id = engine.submit(wf, ExecutionContext::new(), None).await.unwrap();
    engine.wait(&id).await.unwrap();
    assert!(workflows.delete_workflow(&uid).await.unwrap());

    let err = engine.retry(&id).await.unwrap_err();
    assert!(
        matches!(err, EngineError::WorkflowNotFound { version: 1, .. }),
        "{err}"
    );
}

#[tokio::test]
async fn finished_runs_leave_memory_once_their_record_is_stored() {
    let store = Arc::new(InMemoryExecutionStore::new());
    let engine = engine_with(&ScriptedStep::new()).with_execution_store(store.clone());
    let id = engine
        .submit(workflow(vec![log_step("a")]), ExecutionContext::new(), None)
        .await
        .unwrap();
    engine.wait(&id).await.unwrap();

    // With the stored record gone nothing else answers for the run.
    assert!(store.delete(&id).await.unwrap());
    assert_eq!(engine.query(&id).await.unwrap(), None);
    assert!(!engine.cancel(&id).await);
}

#[tokio::test]
async fn runs_stay_in_memory_when_their_record_cannot_be_stored() {
    let engine = engine_with(&ScriptedStep::new()).with_execution_store(Arc::new(BrokenStore));
    let id = engine
        .submit(workflow(vec![log_step("a")]), ExecutionContext::new(), None)
        .await
        .unwrap();
    engine.wait(&id).await.unwrap();

    let log = engine.query(&id).await.unwrap().unwrap();
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.step_order(), vec!["a"]);
}

#[tokio::test]
async fn finished_runs_are_answered_from_the_store() {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
    let engine = engine_with(&ScriptedStep::new()).with_execution_store(Arc::clone(&store));
    let id = engine
        .submit(workflow(vec![log_step("a")]), ExecutionContext::new(), None)
        .await
        .unwrap();
    let live = engine.wait(&id).await.unwrap().unwrap();

    // A fresh engine has no in-memory runs, only the shared store.
    let restarted = engine_with(&ScriptedStep::new()).with_execution_store(store);
    let stored = restarted.query(&id).await.unwrap().unwrap();
    assert_eq!(stored, live);
}

#[tokio::test]
async fn subscribers_observe_the_run_lifecycle() {
    let engine = engine_with(&ScriptedStep::new());
    let mut events = engine.subscribe();

    let id = engine
        .submit(workflow(vec![log_step("only")]), ExecutionContext::new(), None)
        .await
        .unwrap();
    engine.wait(&id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().all(|e| e.execution_id() == id));
    assert!(matches!(seen.first(), Some(ExecutionEvent::RunStarted { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepCompleted { step_uid, .. } if step_uid == "only"
    )));
    assert!(matches!(
        seen.last(),
        Some(ExecutionEvent::RunFinished { status: ExecutionStatus::Completed, .. })
    ));
}
