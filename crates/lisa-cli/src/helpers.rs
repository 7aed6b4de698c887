//! Shared helpers for the `lisa` binary: tracing setup, configuration
//! loading, service assembly and output formatting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use lisa_agent::{AgentRegistry, CompletionGateway, GatewaySessionHub, OrchestratorConfig, TaskRunner};
use lisa_kernel::{Event, EventBus, KernelError};
use lisa_workflow::{ToolRegistry, Workflow, WorkflowEngine, WorkflowStore};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Config file picked up from the working directory when `--config` is not
/// given.
const DEFAULT_CONFIG_FILE: &str = "lisa.toml";

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Install the global tracing subscriber.  `RUST_LOG` wins over
/// `default_level`.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Resolve the orchestrator configuration.
///
/// An explicit `--config` path is loaded as-is.  Otherwise `lisa.toml` in
/// the working directory is used when present, and the environment
/// otherwise.  A file without backends borrows them from the environment.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let path: Option<PathBuf> = match path {
        Some(p) => Some(p.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    let mut config = match &path {
        Some(p) => OrchestratorConfig::load(p)
            .with_context(|| format!("failed to load config from {}", p.display()))?,
        None => {
            debug!("no config file, reading environment");
            OrchestratorConfig::from_env()
        }
    };

    if config.backends.is_empty() && path.is_some() {
        config.backends = OrchestratorConfig::from_env().backends;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Service assembly
// ---------------------------------------------------------------------------

/// Every long-lived service, wired together.
pub struct Services {
    pub bus: EventBus,
    pub gateway: CompletionGateway,
    pub store: WorkflowStore,
}

/// Build the gateway, runner, engine and store from `config`.
pub fn build_services(config: &OrchestratorConfig) -> Result<Services> {
    let backends = config.build_backends().context("failed to build backends")?;
    if backends.is_empty() {
        bail!(
            "no completion backends configured; set ANTHROPIC_API_KEY, OPENAI_API_KEY, \
             GROQ_API_KEY, DEEPSEEK_API_KEY or OLLAMA_MODEL, or pass --config"
        );
    }

    let bus = EventBus::new(config.events.capacity);
    let gateway = CompletionGateway::new(backends, config.gateway_config(), bus.clone());
    let registry = AgentRegistry::with_templates();
    let runner = TaskRunner::new(
        registry.clone(),
        Arc::new(GatewaySessionHub::new(gateway.clone())),
        bus.clone(),
    )
    .with_config(config.runner_config());
    let engine = WorkflowEngine::new(Arc::new(runner), Arc::new(ToolRegistry::new()), bus.clone());

    info!(
        backends = gateway.backends().len(),
        agents = registry.len(),
        "services ready"
    );
    Ok(Services {
        store: WorkflowStore::new(engine),
        bus,
        gateway,
    })
}

/// Log workflow and task progress from the bus until it closes.
pub fn spawn_progress_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => log_event(&envelope.event),
                Err(KernelError::SubscriberLagged { .. }) => continue,
                Err(_) => break,
            }
        }
    })
}

fn log_event(event: &Event) {
    match event {
        Event::StepStarted {
            step_id,
            step_index,
            ..
        } => info!(step_id = %step_id, step_index, "step started"),
        Event::StepCompleted { step_id, .. } => info!(step_id = %step_id, "step completed"),
        Event::StepFailed {
            step_id,
            error,
            absorbed,
            ..
        } => warn!(step_id = %step_id, error = %error, absorbed, "step failed"),
        Event::HumanInputRequired {
            prompt, variable, ..
        } => warn!(variable = %variable, prompt = %prompt, "human input requested; continuing with placeholder"),
        Event::CompletionFailed {
            backend_id,
            attempt,
            error,
        } => warn!(backend_id = %backend_id, attempt, error = %error, "completion attempt failed"),
        Event::SystemEvent { category, message } => debug!(category = %category, "{message}"),
        other => debug!(kind = other.kind(), "event"),
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Print each step's stored result in step order.
pub fn print_results(workflow: &Workflow) {
    println!();
    println!("  {} [{}]", workflow.name, workflow.status);
    if let Some(error) = &workflow.error {
        println!("  error: {error}");
    }
    for step in &workflow.steps {
        let Some(result) = workflow.results.get(&step.id) else {
            continue;
        };
        let title = if step.name.is_empty() { &step.id } else { &step.name };
        println!();
        println!("── {title} ──");
        match result {
            Value::String(text) => println!("{text}"),
            other => println!(
                "{}",
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
            ),
        }
    }
    println!();
}

/// Parse a `key=value` pair.  Values that parse as JSON are kept as JSON,
/// everything else is a string.
pub fn parse_var(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}
