//! Error taxonomy for the delivery engine.
//!
//! The split that matters operationally is transient vs permanent send
//! failures: transient ones re-enter the retry cycle, permanent ones go
//! terminal immediately. Store errors abort the current tick and are retried
//! on the next one; a coordination-store error at startup is fatal.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SendlaneError>;

/// A send attempt that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendFailure {
    /// Network hiccup, throttling, device briefly offline — retried with
    /// backoff up to the configured attempt ceiling.
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Invalid recipient or rejected content — never retried.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendFailure::Transient(_))
    }
}

/// Top-level error type for the engine.
#[derive(Debug, Error)]
pub enum SendlaneError {
    #[error(transparent)]
    Transport(#[from] SendFailure),

    /// The message store rejected or failed an operation. The current tick
    /// aborts; every store operation is independently idempotent, so partial
    /// progress is safe to leave in place until the next tick.
    #[error("store error: {0}")]
    Store(String),

    /// The shared coordination store is unreachable. Fatal at startup:
    /// cross-process deduplication depends on it, so the broadcast subsystem
    /// refuses to start rather than degrading to a single-process mode.
    #[error("coordination store unavailable: {0}")]
    Coordination(String),

    /// A pool or worker ceiling was hit. The creation request is rejected
    /// synchronously; the caller retries later or sheds load.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("config error: {0}")]
    Config(String),

    /// A sequence step graph that no contact could traverse (no entry point,
    /// or steps unreachable from every entry point).
    #[error("invalid sequence: {0}")]
    InvalidSequence(String),
}

impl SendlaneError {
    /// Shorthand for store-layer failures.
    pub fn store(msg: impl Into<String>) -> Self {
        SendlaneError::Store(msg.into())
    }
}
