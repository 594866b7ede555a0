//! `dagflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: report every issue in a workflow or graph JSON file.
//! - `plan`: compile a workflow and print its execution plan.
//! - `run`: execute a workflow with the built-in step handlers.
//! - `show`: print a stored execution log.
//! - `list`: list stored executions.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::{ExecutionStatus, ExecutionStore, SqliteStore};
use engine::{
    EngineConfig, ExecutionLimits, ExecutionLog, GraphDocument, PersistenceBackend, StepRegistry,
    Workflow, WorkflowEngine,
};
use nodes::ExecutionContext;

/// `workflow` is the target `log` steps write under.
const DEFAULT_FILTER: &str = "dagflow=info,engine=info,workflow=info,warn";

#[derive(Parser)]
#[command(name = "dagflow", about = "Workflow DAG compiler and executor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow (or compiled-graph) JSON file.
    Validate {
        path: PathBuf,
    },
    /// Compile a workflow and print its execution plan as JSON.
    Plan {
        path: PathBuf,
    },
    /// Run a workflow to completion and print its execution log.
    Run {
        path: PathBuf,
        /// JSON object of input parameters.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Uid of the user the run is attributed to.
        #[arg(long)]
        user: Option<String>,
        /// Record the run in the SQLite database.
        #[arg(long)]
        persist: bool,
        #[command(flatten)]
        limits: LimitArgs,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Print a stored execution log.
    Show {
        execution_id: String,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// List stored executions; active ones unless filtered.
    List {
        #[arg(long)]
        status: Option<ExecutionStatus>,
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[command(flatten)]
        database: DatabaseArgs,
    },
}

#[derive(Args)]
struct LimitArgs {
    #[arg(long, env = "DAGFLOW_MAX_DB_QUERIES", default_value_t = 100)]
    max_db_queries: u32,
    #[arg(long, env = "DAGFLOW_MAX_API_CALLS", default_value_t = 10)]
    max_api_calls: u32,
    #[arg(long, env = "DAGFLOW_MAX_EMAILS", default_value_t = 10)]
    max_emails: u32,
    #[arg(long, env = "DAGFLOW_MAX_STEPS", default_value_t = 100)]
    max_steps: u32,
    /// Whole-run ceiling, in milliseconds.
    #[arg(long, env = "DAGFLOW_WORKFLOW_TIMEOUT", default_value_t = 300_000)]
    workflow_timeout: u64,
    /// Default per-step timeout, in milliseconds.
    #[arg(long, env = "DAGFLOW_STEP_TIMEOUT", default_value_t = 30_000)]
    step_timeout: u64,
}

impl From<LimitArgs> for ExecutionLimits {
    fn from(args: LimitArgs) -> Self {
        Self {
            max_db_queries: args.max_db_queries,
            max_api_calls: args.max_api_calls,
            max_emails: args.max_emails,
            max_steps: args.max_steps,
            workflow_timeout_ms: args.workflow_timeout,
            step_timeout_ms: args.step_timeout,
        }
    }
}

#[derive(Args)]
struct DatabaseArgs {
    #[arg(long, env = "DAGFLOW_DATABASE_URL", default_value = "sqlite://dagflow.db")]
    database_url: String,
}

impl DatabaseArgs {
    async fn open(&self) -> Result<SqliteStore> {
        SqliteStore::connect(&self.database_url, 5)
            .await
            .with_context(|| format!("cannot open database {}", self.database_url))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Plan { path } => plan(&path),
        Command::Run {
            path,
            input,
            user,
            persist,
            limits,
            database,
        } => {
            let mut config = EngineConfig::default().with_limits(limits.into());
            if persist {
                config.persistence.backend = PersistenceBackend::Sqlite;
                config.persistence.database_url = database.database_url;
            }
            run(&path, input.as_deref(), user, &config).await
        }
        Command::Show {
            execution_id,
            database,
        } => {
            let store = database.open().await?;
            let Some(record) = store.get(&execution_id).await? else {
                eprintln!("execution {execution_id} not found");
                return Ok(ExitCode::FAILURE);
            };
            print_json(&ExecutionLog::try_from(record)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List {
            status,
            workflow,
            limit,
            database,
        } => {
            let store = database.open().await?;
            let mut records = match (status, workflow) {
                (_, Some(workflow_uid)) => store.list_for_workflow(&workflow_uid, limit).await?,
                (Some(status), None) => store.list_by_status(status).await?,
                (None, None) => store.list_active().await?,
            };
            if let Some(status) = status {
                records.retain(|r| r.status == status);
            }
            records.truncate(limit);

            for record in records {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.execution_id,
                    record.workflow_uid,
                    record.status,
                    record.started_at.to_rfc3339()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn validate(path: &Path) -> Result<ExitCode> {
    let doc = load_graph(path)?;
    let result = engine::validate(&doc);

    for issue in &result.issues {
        let nodes = if issue.nodes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", issue.nodes.join(", "))
        };
        println!(
            "{:<8} {:<18} {}{nodes}",
            issue.severity.as_str(),
            issue.code.as_str(),
            issue.message
        );
    }

    if result.valid {
        println!("workflow is valid ({} issue(s))", result.issues.len());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("validation failed: {} error(s)", result.errors().count());
        Ok(ExitCode::FAILURE)
    }
}

fn plan(path: &Path) -> Result<ExitCode> {
    let doc = load_graph(path)?;
    match engine::compile(&doc) {
        Ok(plan) => {
            print_json(&plan)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("compilation failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(
    path: &Path,
    input: Option<&Path>,
    user: Option<String>,
    config: &EngineConfig,
) -> Result<ExitCode> {
    let workflow: Workflow = serde_json::from_value(read_json(path)?)
        .with_context(|| format!("{} is not a workflow", path.display()))?;

    let mut ctx = ExecutionContext::new();
    if let Some(input) = input {
        let params: Map<String, Value> = serde_json::from_value(read_json(input)?)
            .with_context(|| format!("{} is not a JSON object", input.display()))?;
        ctx = ctx.with_input(params);
    }

    let mut engine = WorkflowEngine::new(config, StepRegistry::with_builtins());
    if config.persistence.backend == PersistenceBackend::Sqlite {
        let store = Arc::new(
            SqliteStore::connect(
                &config.persistence.database_url,
                config.persistence.max_connections,
            )
            .await?,
        );
        engine = engine
            .with_execution_store(store.clone())
            .with_workflow_store(store);
    }

    let execution_id = engine.submit(workflow, ctx, user).await?;
    info!(%execution_id, "waiting for execution");
    let log = engine
        .wait(&execution_id)
        .await?
        .with_context(|| format!("execution {execution_id} vanished"))?;

    print_json(&log)?;
    Ok(if log.status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

/// Accepts either a compiled-graph document (`nodes`/`edges`) or a workflow
/// definition (`steps`), which is converted first.
fn load_graph(path: &Path) -> Result<GraphDocument> {
    let value = read_json(path)?;
    if value.get("nodes").is_some() {
        return serde_json::from_value(value)
            .with_context(|| format!("{} is not a graph document", path.display()));
    }
    let workflow: Workflow = serde_json::from_value(value)
        .with_context(|| format!("{} is not a workflow", path.display()))?;
    Ok(workflow.to_graph())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
