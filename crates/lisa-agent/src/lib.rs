//! Lisa agent runtime.
//!
//! Everything between a prompt and a completion backend:
//!
//! - **[`llm`]** -- Common request/response types, HTTP backend adapters,
//!   the provider health router and the retrying, failing-over
//!   [`CompletionGateway`].
//! - **[`registry`]** -- The [`AgentRegistry`] of agent personas, seeded
//!   with six templates.
//! - **[`session`]** -- Conversational sessions; the gateway-backed
//!   [`GatewaySessionHub`].
//! - **[`runner`]** -- The [`TaskRunner`], which executes one prompt against
//!   one agent in an ephemeral session.
//! - **[`config`]** -- [`OrchestratorConfig`], loaded from TOML, JSON or the
//!   environment.

pub mod config;
pub mod error;
pub mod llm;
pub mod registry;
pub mod runner;
pub mod session;

pub use config::OrchestratorConfig;
pub use error::{AgentError, Result};
pub use llm::{
    BackendConfig, BackendId, BackendReply, CompletionBackend, CompletionGateway,
    CompletionRequest, CompletionResponse, GatewayConfig, HealthRecord, HealthRouter, Message,
    ProbeOutcome, Role, Usage,
};
pub use registry::{AgentDefinition, AgentRegistry};
pub use runner::{AgentTask, RunnerConfig, TaskContext, TaskExecutor, TaskRunner, TaskStatus};
pub use session::{
    ChannelType, GatewaySessionHub, Session, SessionEvent, SessionHub, SessionOptions,
    SessionPayload,
};
