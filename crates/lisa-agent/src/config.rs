//! Orchestrator configuration.
//!
//! Loaded from a TOML or JSON file (chosen by extension) or assembled purely
//! from environment variables.  A missing file is not an error: defaults are
//! used and a warning is logged.
//!
//! ```toml
//! [gateway]
//! max_retries = 3
//! retry_delay_ms = 1000
//!
//! [[backends]]
//! provider = "anthropic"
//! model = "claude-sonnet-4-20250514"
//! api_key_env = "ANTHROPIC_API_KEY"
//! priority = 1
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::llm::adapter::{CompletionBackend, build_backend};
use crate::llm::gateway::GatewayConfig;
use crate::llm::health::DEFAULT_FAILURE_THRESHOLD;
use crate::llm::types::BackendConfig;
use crate::runner::RunnerConfig;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[gateway]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub failure_threshold: u32,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: 30,
            health_check_interval_secs: 60,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// `[runner]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub task_timeout_secs: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: 120,
        }
    }
}

/// `[events]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Capacity of the event bus ring buffer.
    pub capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            capacity: lisa_kernel::DEFAULT_BUS_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Everything needed to assemble a gateway and task runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub gateway: GatewaySection,
    pub runner: RunnerSection,
    pub events: EventsSection,
    pub backends: Vec<BackendConfig>,
}

impl OrchestratorConfig {
    /// Load from `path`.  `.json` files are parsed as JSON, anything else as
    /// TOML.  A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "configuration file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_json(path) {
            serde_json::from_str(&content).map_err(|e| AgentError::Config {
                reason: format!("failed to parse JSON config {}: {e}", path.display()),
            })?
        } else {
            toml::from_str(&content).map_err(|e| AgentError::Config {
                reason: format!("failed to parse TOML config {}: {e}", path.display()),
            })?
        };
        config.validate()?;

        info!(path = %path.display(), backends = config.backends.len(), "configuration loaded");
        Ok(config)
    }

    /// Write the configuration to `path`, in the format implied by its
    /// extension.
    ///
    /// Inline API keys are never written; each is replaced by the name of
    /// the provider's conventional key variable.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut on_disk = self.clone();
        for backend in &mut on_disk.backends {
            if backend.api_key.take().is_some() && backend.api_key_env.is_none() {
                backend.api_key_env = Some(format!("{}_API_KEY", backend.provider.to_ascii_uppercase()));
            }
        }

        let content = if is_json(path) {
            serde_json::to_string_pretty(&on_disk)?
        } else {
            toml::to_string_pretty(&on_disk).map_err(|e| AgentError::Config {
                reason: format!("failed to serialize TOML config: {e}"),
            })?
        };
        std::fs::write(path, content)?;
        info!(path = %path.display(), backends = on_disk.backends.len(), "configuration written");
        Ok(())
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Each provider whose key variable is set becomes a backend, in the
    /// priority order anthropic, openai, groq, deepseek.  `OLLAMA_MODEL` adds
    /// a keyless local backend as the last resort.  `<PROVIDER>_MODEL`
    /// overrides a provider's default model.
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        const HOSTED: &[(&str, &str)] = &[
            ("anthropic", "claude-sonnet-4-20250514"),
            ("openai", "gpt-4o-mini"),
            ("groq", "llama-3.3-70b-versatile"),
            ("deepseek", "deepseek-chat"),
        ];

        let mut backends = Vec::new();
        let mut priority = 1;
        for (provider, default_model) in HOSTED {
            let upper = provider.to_ascii_uppercase();
            if let Some(key) = get(&format!("{upper}_API_KEY")) {
                let model = get(&format!("{upper}_MODEL")).unwrap_or_else(|| (*default_model).to_owned());
                backends.push(BackendConfig::new(*provider, model, priority).with_api_key(key));
                priority += 1;
            }
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            let mut local = BackendConfig::new("ollama", model, priority);
            local.base_url = get("OLLAMA_BASE_URL");
            backends.push(local);
        }

        let mut config = Self {
            backends,
            ..Self::default()
        };
        if let Some(retries) = get("LISA_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            config.gateway.max_retries = retries;
        }
        if let Some(secs) = get("LISA_TASK_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.runner.task_timeout_secs = secs;
        }
        config
    }

    /// Reject values that would make the gateway or runner unusable.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.max_retries == 0 {
            return Err(AgentError::Config {
                reason: "gateway.max_retries must be at least 1".into(),
            });
        }
        if self.gateway.failure_threshold == 0 {
            return Err(AgentError::Config {
                reason: "gateway.failure_threshold must be at least 1".into(),
            });
        }
        if self.gateway.request_timeout_secs == 0 {
            return Err(AgentError::Config {
                reason: "gateway.request_timeout_secs must be at least 1".into(),
            });
        }
        if self.runner.task_timeout_secs == 0 {
            return Err(AgentError::Config {
                reason: "runner.task_timeout_secs must be at least 1".into(),
            });
        }
        if self.events.capacity == 0 {
            return Err(AgentError::Config {
                reason: "events.capacity must be at least 1".into(),
            });
        }
        if let Some(dup) = self.backends.iter().enumerate().find_map(|(i, b)| {
            self.backends[..i]
                .iter()
                .any(|other| other.id() == b.id())
                .then(|| b.id())
        }) {
            return Err(AgentError::Config {
                reason: format!("backend {dup} is configured twice"),
            });
        }
        Ok(())
    }

    /// The gateway tunables.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.gateway.max_retries,
            retry_delay: Duration::from_millis(self.gateway.retry_delay_ms),
            request_timeout: Duration::from_secs(self.gateway.request_timeout_secs),
            health_check_interval: Duration::from_secs(self.gateway.health_check_interval_secs),
            failure_threshold: self.gateway.failure_threshold,
        }
    }

    /// The task runner tunables.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            task_timeout: Duration::from_secs(self.runner.task_timeout_secs),
        }
    }

    /// Build an HTTP adapter for every configured backend.  Backends whose
    /// credentials cannot be resolved are skipped with a warning.
    pub fn build_backends(&self) -> Result<Vec<Arc<dyn CompletionBackend>>> {
        let http = crate::llm::adapter::http_client()?;
        let mut built = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            match build_backend(backend.clone(), http.clone()) {
                Ok(adapter) => built.push(adapter),
                Err(AgentError::MissingApiKey { provider }) => {
                    warn!(backend = %backend.id(), provider = %provider, "skipping backend without API key");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(built)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("json")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.gateway, GatewaySection::default());
        assert!(config.backends.is_empty());
    }

    #[test]
    fn loads_toml_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[gateway]
max_retries = 5

[runner]
task_timeout_secs = 10

[[backends]]
provider = "openai"
model = "gpt-4o-mini"
priority = 2

[[backends]]
provider = "anthropic"
model = "claude-sonnet-4-20250514"
api_key_env = "MY_KEY"
priority = 1
"#
        )
        .unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.gateway.max_retries, 5);
        assert_eq!(config.gateway.retry_delay_ms, 1000);
        assert_eq!(config.runner_config().task_timeout, Duration::from_secs(10));
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].api_key_env.as_deref(), Some("MY_KEY"));
        assert_eq!(config.events.capacity, lisa_kernel::DEFAULT_BUS_CAPACITY);
    }

    #[test]
    fn loads_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"gateway": {{"retry_delay_ms": 5}}, "backends": [{{"provider": "ollama", "model": "qwen2.5"}}]}}"#
        )
        .unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.gateway_config().retry_delay, Duration::from_millis(5));
        assert_eq!(config.backends[0].id().as_str(), "ollama/qwen2.5");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "[gateway]\nmax_retries = 0\n").unwrap();
        assert!(matches!(
            OrchestratorConfig::load(file.path()),
            Err(AgentError::Config { .. })
        ));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = OrchestratorConfig::default();
        config.gateway.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(AgentError::Config { reason }) if reason.contains("request_timeout_secs")
        ));

        let mut config = OrchestratorConfig::default();
        config.runner.task_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(AgentError::Config { reason }) if reason.contains("task_timeout_secs")
        ));

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "[runner]\ntask_timeout_secs = 0\n").unwrap();
        assert!(OrchestratorConfig::load(file.path()).is_err());
    }

    #[test]
    fn duplicate_backends_are_rejected() {
        let config = OrchestratorConfig {
            backends: vec![
                BackendConfig::new("openai", "m", 1),
                BackendConfig::new("openai", "m", 2),
            ],
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load_preserves_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lisa.toml");
        let config = OrchestratorConfig {
            backends: vec![BackendConfig::new("groq", "llama", 3).with_api_key("gsk-secret")],
            ..OrchestratorConfig::default()
        };
        config.save(&path).unwrap();
        assert!(!std::fs::read_to_string(&path).unwrap().contains("gsk-secret"));

        let loaded = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(loaded.backends[0].priority, 3);
        assert_eq!(loaded.backends[0].api_key, None);
        assert_eq!(loaded.backends[0].api_key_env.as_deref(), Some("GROQ_API_KEY"));
    }

    #[test]
    fn env_lookup_builds_backends_in_priority_order() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-o"),
            ("ANTHROPIC_API_KEY", "sk-a"),
            ("OPENAI_MODEL", "gpt-4.1"),
            ("OLLAMA_MODEL", "qwen2.5"),
            ("GROQ_API_KEY", "  "),
            ("LISA_MAX_RETRIES", "2"),
        ]);
        let config = OrchestratorConfig::from_env_with(|k| vars.get(k).map(|v| (*v).to_owned()));

        let ids: Vec<_> = config.backends.iter().map(|b| b.id().to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "anthropic/claude-sonnet-4-20250514",
                "openai/gpt-4.1",
                "ollama/qwen2.5"
            ]
        );
        assert_eq!(config.backends[2].priority, 3);
        assert_eq!(config.gateway.max_retries, 2);
    }
}
