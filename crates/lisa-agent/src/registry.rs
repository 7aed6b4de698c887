//! Agent registry.
//!
//! Keyed store of [`AgentDefinition`]s.  A definition describes one persona
//! the task runner can execute against: its system prompt, sampling
//! parameters and an optional preferred backend.
//!
//! The registry is backed by [`DashMap`] and is cheaply cloneable, so the
//! task runner and the CLI can share one instance without a global lock.
//!
//! # Example
//!
//! ```rust
//! # use lisa_agent::registry::AgentRegistry;
//! let registry = AgentRegistry::with_templates();
//! let planner = registry.get("planner").unwrap();
//! assert_eq!(planner.name, "Planner");
//! assert_eq!(registry.list().len(), 6);
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::llm::types::BackendId;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A persona the task runner can execute tasks against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Registry key (e.g. `"planner"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// System prompt installed in every session opened for this agent.
    pub system_prompt: String,
    /// Backend to try first while it is healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<BackendId>,
    /// Tool ids the agent may use.  `None` means no restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl AgentDefinition {
    /// Create a definition with default sampling parameters.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            preferred_backend: None,
            tools: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }

    /// Builder: set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Builder: set the token limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Builder: set the preferred backend.
    pub fn with_preferred_backend(mut self, backend: BackendId) -> Self {
        self.preferred_backend = Some(backend);
        self
    }

    /// Builder: restrict the agent to the given tools.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// The six built-in agent templates.
pub fn builtin_templates() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition::new(
            "planner",
            "Planner",
            "You are a planning agent. Break the user's goal into a short, \
             ordered list of concrete steps. Name the inputs each step needs \
             and the output it produces. Do not carry out the steps.",
        )
        .with_temperature(0.3)
        .with_max_tokens(2048),
        AgentDefinition::new(
            "researcher",
            "Researcher",
            "You are a research agent. Gather the relevant facts on the given \
             topic, state where each claim comes from when you know it, and \
             flag anything uncertain.",
        )
        .with_temperature(0.5),
        AgentDefinition::new(
            "coder",
            "Coder",
            "You are a senior software engineer. Write correct, idiomatic, \
             well-structured code for the task. Return code blocks with a \
             brief explanation of any non-obvious decision.",
        )
        .with_temperature(0.2)
        .with_max_tokens(8192),
        AgentDefinition::new(
            "reviewer",
            "Reviewer",
            "You are a meticulous reviewer. Find errors, gaps and risks in the \
             material you are given and propose specific fixes, most \
             important first.",
        )
        .with_temperature(0.3),
        AgentDefinition::new(
            "writer",
            "Writer",
            "You are a clear technical writer. Turn the material you are given \
             into well-organized prose for the intended audience.",
        )
        .with_temperature(0.8),
        AgentDefinition::new(
            "analyst",
            "Analyst",
            "You are an analyst. Identify patterns, trade-offs and conclusions \
             in the material you are given and support each with evidence \
             from it.",
        )
        .with_temperature(0.4),
    ]
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent agent registry backed by [`DashMap`].
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<DashMap<String, AgentDefinition>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-seeded with the built-in templates.
    #[must_use]
    pub fn with_templates() -> Self {
        let registry = Self::new();
        for agent in builtin_templates() {
            registry.register(agent);
        }
        registry
    }

    /// Register an agent.  An existing definition with the same id is
    /// replaced.
    pub fn register(&self, agent: AgentDefinition) {
        tracing::debug!(agent_id = %agent.id, "agent registered");
        self.inner.insert(agent.id.clone(), agent);
    }

    /// Remove an agent.  Returns the removed definition if it existed.
    pub fn unregister(&self, id: &str) -> Option<AgentDefinition> {
        let removed = self.inner.remove(id).map(|(_, agent)| agent);
        if removed.is_some() {
            tracing::debug!(agent_id = %id, "agent unregistered");
        }
        removed
    }

    /// Look up an agent by id.
    pub fn get(&self, id: &str) -> Result<AgentDefinition> {
        self.inner
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AgentError::AgentNotFound {
                agent_id: id.to_owned(),
            })
    }

    /// Whether an agent with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    /// All registered agents, sorted by id.
    pub fn list(&self) -> Vec<AgentDefinition> {
        let mut agents: Vec<_> = self.inner.iter().map(|e| e.value().clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_seeded_and_sorted() {
        let registry = AgentRegistry::with_templates();
        let ids: Vec<_> = registry.list().into_iter().map(|a| a.id).collect();
        assert_eq!(
            ids,
            vec!["analyst", "coder", "planner", "researcher", "reviewer", "writer"]
        );
    }

    #[test]
    fn get_missing_agent_is_not_found() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(AgentError::AgentNotFound { agent_id }) if agent_id == "ghost"
        ));
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let registry = AgentRegistry::with_templates();
        registry.register(AgentDefinition::new("coder", "Rustacean", "Write Rust.").with_temperature(0.0));
        assert_eq!(registry.get("coder").unwrap().name, "Rustacean");
        assert_eq!(registry.len(), 6);

        let removed = registry.unregister("coder").unwrap();
        assert_eq!(removed.system_prompt, "Write Rust.");
        assert!(!registry.contains("coder"));
        assert!(registry.unregister("coder").is_none());
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let agent: AgentDefinition = serde_json::from_str(
            r#"{"id":"x","name":"X","system_prompt":"be x"}"#,
        )
        .unwrap();
        assert!((agent.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(agent.max_tokens, 4096);
        assert!(agent.tools.is_none());
    }
}
