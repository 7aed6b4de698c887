//! Workflow error types.

use lisa_agent::AgentError;

use crate::workflow::WorkflowStatus;

/// Unified error type for workflow definition, evaluation and execution.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    // -- Lookup errors -------------------------------------------------------
    /// No workflow with this id is stored.
    #[error("workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    /// A step id referenced by a jump, parallel or conditional step does not
    /// exist in the workflow.
    #[error("step not found: {step_id}")]
    StepNotFound { step_id: String },

    /// No tool with this id is registered.
    #[error("tool not found: {tool_id}")]
    ToolNotFound { tool_id: String },

    // -- State errors --------------------------------------------------------
    /// The workflow already has an execution in flight.
    #[error("workflow {workflow_id} is already running")]
    AlreadyRunning { workflow_id: String },

    /// The requested status change is not allowed.
    #[error("invalid workflow transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    // -- Step errors ---------------------------------------------------------
    /// The definition or its runtime inputs are malformed.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A condition expression could not be evaluated.
    #[error("expression evaluation failed: {reason}")]
    Evaluation { reason: String },

    /// The agent task behind an `agent` step failed.
    #[error("task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    /// A tool invocation failed.
    #[error("tool {tool_id} failed: {reason}")]
    ToolFailed { tool_id: String, reason: String },

    /// An error surfaced from the agent runtime.
    #[error(transparent)]
    Agent(#[from] AgentError),

    // -- Serialization -------------------------------------------------------
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic -------------------------------------------------------------
    #[error("internal workflow error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the workflow crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;

impl WorkflowError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn evaluation(reason: impl Into<String>) -> Self {
        Self::Evaluation {
            reason: reason.into(),
        }
    }
}
