//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`].  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

/// Unified error type for the Lisa kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Event bus errors ---------------------------------------------------
    /// A subscriber fell behind the bus and the oldest events were dropped.
    ///
    /// The subscriber is still usable; the next `recv` continues with the
    /// oldest event still retained.
    #[error("event subscriber lagged behind by {missed} events")]
    SubscriberLagged {
        /// How many events were overwritten before this subscriber saw them.
        missed: u64,
    },

    /// Every sender of the bus has been dropped.
    #[error("event bus closed")]
    BusClosed,

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
