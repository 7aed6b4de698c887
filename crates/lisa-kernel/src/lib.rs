//! Lisa kernel.
//!
//! Shared foundation for the orchestration core:
//!
//! - **[`ipc`]** -- Typed publish/subscribe event bus backed by
//!   [`tokio::sync::broadcast`].  Every task, workflow, health and
//!   completion transition is published here.
//! - **[`error`]** -- Kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod error;
pub mod ipc;

pub use error::{KernelError, Result};
pub use ipc::{DEFAULT_BUS_CAPACITY, Envelope, Event, EventBus, EventSubscriber};
