//! Core error model and failure taxonomy.

use thiserror::Error;

/// Result type used by the pure core layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on deterministic failures (validation, malformed ids).
/// Infrastructure concerns belong in the infra crate's error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// How a failure must be treated by the component that observes it.
///
/// Every public error in the pipeline translates into one of these kinds.
/// Stale or duplicate projection writes are *not* failures; they surface as
/// outcomes and never reach this enum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Infrastructure unavailable (bus, store). Retry with backoff; leave the
    /// work item in a recoverable state.
    Transient,
    /// Malformed or unresolvable input. Log and skip; never retry.
    Data,
    /// Conflicting or invalid configuration. Surface to the caller.
    Configuration,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl From<&CoreError> for FailureKind {
    fn from(_: &CoreError) -> Self {
        FailureKind::Data
    }
}
