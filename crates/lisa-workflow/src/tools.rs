//! Tool invocation.
//!
//! `tool` steps call out through [`ToolInvoker`].  The stock invoker is a
//! [`ToolRegistry`] that maps tool ids to the [`ToolAdapter`] exposing them,
//! so integrations (filesystem, shell, web, ...) can be plugged in without
//! the engine knowing about them.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, WorkflowError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One tool call issued by a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: String,
    /// Parameters with every template already interpolated.
    pub parameters: Value,
    /// The calling workflow's id.
    pub session_id: String,
}

/// Description of a tool an adapter exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Executes tool invocations on behalf of the workflow engine.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke_tool(&self, invocation: ToolInvocation) -> Result<Value>;
}

/// A component exposing one or more tools.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The unique identifier for this adapter.
    fn adapter_id(&self) -> &str;

    /// The tools this adapter exposes.
    fn tools(&self) -> Vec<ToolDescriptor>;

    /// Execute a named tool.
    async fn execute(&self, tool: &str, parameters: Value, session_id: &str) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps tool ids to the adapters that expose them.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn ToolAdapter>>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tool `adapter` exposes.  Later registrations win on
    /// conflicting tool ids.
    pub fn register(&self, adapter: Arc<dyn ToolAdapter>) {
        for tool in adapter.tools() {
            debug!(tool_id = %tool.name, adapter_id = adapter.adapter_id(), "tool registered");
            self.tools.insert(tool.name, Arc::clone(&adapter));
        }
    }

    /// Whether a tool id is registered.
    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    /// Registered tool ids, sorted.
    pub fn tool_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.tools.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_ids())
            .finish()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke_tool(&self, invocation: ToolInvocation) -> Result<Value> {
        let adapter = self
            .tools
            .get(&invocation.tool_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| WorkflowError::ToolNotFound {
                tool_id: invocation.tool_id.clone(),
            })?;

        debug!(
            tool_id = %invocation.tool_id,
            session_id = %invocation.session_id,
            "invoking tool"
        );
        adapter
            .execute(&invocation.tool_id, invocation.parameters, &invocation.session_id)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct MathAdapter;

    #[async_trait]
    impl ToolAdapter for MathAdapter {
        fn adapter_id(&self) -> &str {
            "math"
        }

        fn tools(&self) -> Vec<ToolDescriptor> {
            vec![
                ToolDescriptor {
                    name: "add".into(),
                    description: "Add a and b".into(),
                },
                ToolDescriptor {
                    name: "fail".into(),
                    description: "Always fails".into(),
                },
            ]
        }

        async fn execute(&self, tool: &str, parameters: Value, session_id: &str) -> Result<Value> {
            match tool {
                "add" => {
                    let a = parameters["a"].as_i64().unwrap_or(0);
                    let b = parameters["b"].as_i64().unwrap_or(0);
                    Ok(json!({ "sum": a + b, "session": session_id }))
                }
                _ => Err(WorkflowError::ToolFailed {
                    tool_id: tool.to_owned(),
                    reason: "nope".into(),
                }),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(MathAdapter));
        registry
    }

    #[tokio::test]
    async fn routes_to_owning_adapter() {
        let out = registry()
            .invoke_tool(ToolInvocation {
                tool_id: "add".into(),
                parameters: json!({ "a": 2, "b": 3 }),
                session_id: "wf-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(out, json!({ "sum": 5, "session": "wf-1" }));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let err = registry()
            .invoke_tool(ToolInvocation {
                tool_id: "mul".into(),
                parameters: Value::Null,
                session_id: "wf-1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ToolNotFound { tool_id } if tool_id == "mul"));
    }

    #[test]
    fn lists_registered_tools() {
        assert_eq!(registry().tool_ids(), vec!["add", "fail"]);
        assert!(registry().contains("fail"));
    }
}
