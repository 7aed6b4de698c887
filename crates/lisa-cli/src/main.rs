//! CLI entry point for the Lisa orchestration core.
//!
//! The `lisa` binary runs workflow files and the built-in research and code
//! pipelines against the configured completion backends, lists the agent
//! templates, probes backend health and writes a starter config file.

mod helpers;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lisa_agent::OrchestratorConfig;
use lisa_workflow::{Workflow, WorkflowStatus};
use serde_json::Value;
use tracing::info;

use crate::helpers::{build_services, init_tracing, load_config, parse_var, print_results, spawn_progress_logger};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Lisa: multi-agent workflows over failover-aware LLM backends.
#[derive(Parser)]
#[command(name = "lisa", version, about = "Lisa orchestration core")]
struct Cli {
    /// Config file (TOML, or JSON by extension).  Defaults to ./lisa.toml,
    /// then the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition file.
    Run {
        /// Path to a `.toml` or `.json` workflow.
        file: PathBuf,

        /// Set a variable before running (`key=value`, repeatable).
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Plan, research, analyze, write and review a topic.
    Research {
        topic: String,
    },

    /// Plan, implement, review and improve a coding task.
    Code {
        task: String,
    },

    /// List the built-in agent templates.
    Agents,

    /// Probe every configured backend once.
    Health,

    /// Write a config file seeded from the environment.
    Init {
        /// Destination (`.toml`, or `.json` by extension).
        #[arg(default_value = "lisa.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json);

    match cli.command {
        Commands::Run { file, vars } => cmd_run(cli.config, file, vars).await,
        Commands::Research { topic } => cmd_pipeline(cli.config, Pipeline::Research(topic)).await,
        Commands::Code { task } => cmd_pipeline(cli.config, Pipeline::Code(task)).await,
        Commands::Agents => cmd_agents(),
        Commands::Health => cmd_health(cli.config).await,
        Commands::Init { path, force } => cmd_init(&path, force),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config: Option<PathBuf>, file: PathBuf, vars: Vec<(String, Value)>) -> Result<()> {
    let mut workflow = Workflow::load(&file)
        .with_context(|| format!("failed to load workflow from {}", file.display()))?;
    workflow.variables.extend(vars);

    let config = load_config(config.as_deref())?;
    let services = build_services(&config)?;
    let id = services.store.insert(workflow)?;
    execute(&services, &id).await
}

// ---------------------------------------------------------------------------
// Subcommands: research / code
// ---------------------------------------------------------------------------

enum Pipeline {
    Research(String),
    Code(String),
}

async fn cmd_pipeline(config: Option<PathBuf>, pipeline: Pipeline) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let services = build_services(&config)?;
    let workflow = match &pipeline {
        Pipeline::Research(topic) => services.store.create_research_pipeline(topic)?,
        Pipeline::Code(task) => services.store.create_code_pipeline(task)?,
    };
    execute(&services, &workflow.id).await
}

async fn execute(services: &helpers::Services, workflow_id: &str) -> Result<()> {
    services.gateway.start();
    let logger = spawn_progress_logger(&services.bus);

    info!(workflow_id, "running workflow");
    let outcome = services.store.execute(workflow_id).await;

    services.gateway.stop();
    logger.abort();

    let workflow = outcome?;
    print_results(&workflow);
    if workflow.status != WorkflowStatus::Completed {
        anyhow::bail!(
            "workflow {} ended {}: {}",
            workflow.name,
            workflow.status,
            workflow.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: agents
// ---------------------------------------------------------------------------

fn cmd_agents() -> Result<()> {
    let registry = lisa_agent::AgentRegistry::with_templates();
    println!();
    for agent in registry.list() {
        let summary = agent.system_prompt.lines().next().unwrap_or_default();
        println!("  {:<12} {:<20} {}", agent.id, agent.name, summary);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: health
// ---------------------------------------------------------------------------

async fn cmd_health(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let services = build_services(&config)?;

    let outcomes = services.gateway.check_health().await;
    println!();
    for outcome in &outcomes {
        let status = if outcome.healthy { "ok" } else { "DOWN" };
        let latency = outcome
            .latency_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "  {:<40} {:<5} {:>8}  {}",
            outcome.backend_id.to_string(),
            status,
            latency,
            outcome.error.as_deref().unwrap_or("")
        );
    }
    println!();

    let healthy = outcomes.iter().filter(|o| o.healthy).count();
    info!(healthy, total = outcomes.len(), "health check finished");
    if healthy == 0 {
        anyhow::bail!("no healthy backends");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: init
// ---------------------------------------------------------------------------

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    let config = OrchestratorConfig::from_env();
    config
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!(
        "wrote {} with {} backend(s)",
        path.display(),
        config.backends.len()
    );
    Ok(())
}
