//! Completion layer: common types, backend adapters, health routing and the
//! retrying gateway.

pub mod adapter;
pub mod gateway;
pub mod health;
pub mod types;

pub use adapter::{
    AnthropicBackend, CompletionBackend, OpenAiCompatibleBackend, build_backend, http_client,
};
pub use gateway::{CompletionGateway, GatewayConfig, ProbeOutcome};
pub use health::{DEFAULT_FAILURE_THRESHOLD, HealthRecord, HealthRouter, order_backends};
pub use types::{
    BackendConfig, BackendId, BackendReply, CompletionRequest, CompletionResponse, Message, Role,
    Usage,
};
