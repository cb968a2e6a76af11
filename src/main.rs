use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maestro_core::config::AppConfig;
use maestro_core::types::{ExecutionId, ExecutionStatus, TriggerType};
use maestro_executors::{ExecutorDeps, ExecutorRegistry};
use maestro_engine::{CronTrigger, ExecuteOptions, RunLogger, StepGraph, WorkflowEngine};
use maestro_store::{SqliteStore, WorkflowBundle};

#[derive(Parser)]
#[command(name = "maestro", version, about = "Multi-agent workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file without running it
    Validate {
        /// Workflow bundle (JSON, or TOML by extension)
        file: PathBuf,
    },
    /// Load a workflow bundle into the store and execute it
    Run {
        file: PathBuf,
        /// Execution input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// manual, scheduled, api, webhook, or event
        #[arg(long, default_value = "manual")]
        trigger: TriggerType,
        /// Override the execution deadline
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List executions of a workflow, newest first
    Executions { workflow_id: String },
    /// Show the log of an execution
    Logs {
        execution_id: String,
        /// Also print per-attempt step records
        #[arg(long)]
        steps: bool,
    },
    /// Cancel an execution
    Cancel { execution_id: String },
    /// Run the configured cron triggers until Ctrl-C
    Cron,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("maestro=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle commands that need neither config nor store
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "maestro", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;
    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.store.resolved_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    info!(path = %db_path.display(), "Store opened");

    match cli.command {
        Commands::Run {
            file,
            input,
            trigger,
            timeout_ms,
        } => {
            let input: Value = serde_json::from_str(&input)?;
            let bundle = WorkflowBundle::load(&file)?;
            for agent in &bundle.agents {
                store.save_agent(agent)?;
            }
            let missing = bundle.missing_agents();
            if !missing.is_empty() {
                warn!(agents = ?missing, "Agents not in bundle, expecting them in the store");
            }
            store.save_workflow(&bundle.workflow)?;

            let engine = Arc::new(WorkflowEngine::bootstrap(&config, store.clone(), store.clone()).await);
            let cancel = CancellationToken::new();
            let logger = start_run_logger(&config, &engine, &cancel);

            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Cancelling execution...");
                ctrl_c.cancel();
            });

            let options = ExecuteOptions {
                trigger,
                timeout_ms,
                cancel: Some(cancel.child_token()),
                ..Default::default()
            };
            let execution = engine
                .execute_with(&bundle.workflow.id, input, options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&execution)?);

            engine.shutdown().await;
            cancel.cancel();
            if let Some(handle) = logger {
                handle.await.ok();
            }
            if execution.status != ExecutionStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Executions { workflow_id } => {
            let engine = offline_engine(&config, store.clone());
            let executions = engine.list_executions(&workflow_id).await?;
            if executions.is_empty() {
                println!("No executions for '{}'.", workflow_id);
            }
            for e in &executions {
                println!(
                    "{}  {:<9}  {:<9}  {}/{} completed, {} failed  {}",
                    e.id,
                    e.status.as_str(),
                    format!("{:?}", e.trigger_type).to_uppercase(),
                    e.steps_completed,
                    e.steps_total,
                    e.steps_failed,
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Logs { execution_id, steps } => {
            let engine = offline_engine(&config, store.clone());
            let id = ExecutionId::from_string(&execution_id);
            let execution = engine.get_execution(&id).await?;
            println!(
                "{} [{}] {}",
                execution.id,
                execution.status,
                execution.error_message.as_deref().unwrap_or("")
            );
            for entry in engine.list_execution_logs(&id).await? {
                let step = match (&entry.step_key, entry.attempt) {
                    (Some(key), Some(attempt)) => format!("{}#{} ", key, attempt),
                    (Some(key), None) => format!("{} ", key),
                    _ => String::new(),
                };
                println!(
                    "{} {:<5} {}{}",
                    entry.created_at.format("%H:%M:%S%.3f"),
                    entry.level.as_str(),
                    step,
                    truncate(&entry.message, 200)
                );
            }
            if steps {
                println!();
                for record in engine.list_step_records(&id).await? {
                    let iteration = record
                        .iteration
                        .map(|i| format!("[{}]", i))
                        .unwrap_or_default();
                    println!(
                        "{}{} attempt {}: {}{}",
                        record.step_key,
                        iteration,
                        record.attempt,
                        record.status.as_str(),
                        record
                            .error
                            .as_deref()
                            .map(|e| format!(" ({})", truncate(e, 120)))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Commands::Cancel { execution_id } => {
            let engine = offline_engine(&config, store.clone());
            let id = ExecutionId::from_string(&execution_id);
            let outcome = engine.cancel_execution(&id).await?;
            if outcome.cancelled {
                println!("Execution {} cancelled.", id);
            } else {
                println!("Execution {} already {}.", id, outcome.status);
            }
        }
        Commands::Cron => {
            let Some(cron_config) = config.cron.clone().filter(|c| !c.jobs.is_empty()) else {
                anyhow::bail!("no [[cron.jobs]] configured in {}", cli.config.display());
            };
            let engine = Arc::new(WorkflowEngine::bootstrap(&config, store.clone(), store.clone()).await);
            let cancel = CancellationToken::new();
            let logger = start_run_logger(&config, &engine, &cancel);

            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down cron triggers...");
                cancel_clone.cancel();
            });

            let trigger = CronTrigger::new(&cron_config, engine.clone(), cancel.clone());
            info!(jobs = trigger.job_count(), "Cron triggers started");
            trigger.run().await;

            engine.shutdown().await;
            if let Some(handle) = logger {
                handle.await.ok();
            }
        }
        Commands::Validate { .. } | Commands::Config | Commands::Completions { .. } => {
            unreachable!("handled before store open")
        }
    }

    Ok(())
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let bundle = WorkflowBundle::load(file)?;
    match StepGraph::build(&bundle.workflow.steps) {
        Ok(graph) => {
            println!(
                "Workflow '{}' is valid: {} steps, order {}",
                bundle.workflow.id,
                graph.len(),
                graph.topological_order().join(" -> ")
            );
            let missing = bundle.missing_agents();
            if !missing.is_empty() {
                println!("Note: agents not defined in this file: {}", missing.join(", "));
            }
            Ok(())
        }
        Err(e) => anyhow::bail!("workflow '{}' is invalid: {}", bundle.workflow.id, e),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".maestro").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Using home config");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

/// Engine for queries and cancellation; it runs nothing, so no capability
/// servers or LLM clients are set up.
fn offline_engine(config: &AppConfig, store: Arc<SqliteStore>) -> WorkflowEngine {
    let registry = ExecutorRegistry::new(ExecutorDeps::default());
    WorkflowEngine::new(config.engine.clone(), store.clone(), store, registry)
}

fn start_run_logger(
    config: &AppConfig,
    engine: &WorkflowEngine,
    cancel: &CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let log_config = config.log.as_ref().filter(|l| l.enabled)?;
    let logger = RunLogger::new(log_config.resolved_dir(), log_config.level);
    let handle = logger.spawn(&engine.events(), cancel.clone());
    info!("RunLogger started (level {})", log_config.level);
    Some(handle)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
