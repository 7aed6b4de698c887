//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure.

use std::time::Duration;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Lookup errors -------------------------------------------------------
    /// The agent id is not present in the registry.
    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    /// The session id does not refer to an open session.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    // -- Timeouts ------------------------------------------------------------
    /// A task did not receive its reply before the deadline.
    #[error("task timed out after {timeout:?}")]
    TaskTimeout { timeout: Duration },

    /// A single backend call exceeded the per-call timeout.
    #[error("backend {backend_id} timed out after {timeout:?}")]
    BackendTimeout {
        backend_id: String,
        timeout: Duration,
    },

    // -- Backend errors ------------------------------------------------------
    /// One attempt against one backend failed.
    #[error("backend {backend_id} failed: {reason}")]
    BackendFailure { backend_id: String, reason: String },

    /// The backend answered but the body could not be parsed.
    #[error("backend response parse error: {reason}")]
    ResponseParse { reason: String },

    /// Every backend/retry combination for one request was exhausted.
    #[error("all backends failed: {}", errors.join("; "))]
    AllBackendsFailed { errors: Vec<String> },

    /// The gateway has no backends to try.
    #[error("no completion backends configured")]
    NoBackendsConfigured,

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    // -- Session errors ------------------------------------------------------
    /// The session produced an error instead of an assistant reply.
    #[error("session {session_id} failed: {reason}")]
    SessionFailed { session_id: String, reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization failed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Reading a file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether this error is one of the timeout variants.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TaskTimeout { .. } | Self::BackendTimeout { .. })
    }
}
