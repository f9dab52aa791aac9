//! Custom error types for the gateway.
//!
//! This module defines the primary error type, `GatewayError`, for the
//! entire application. Using the `thiserror` crate, it provides a
//! centralized and consistent way to classify failures, from request
//! validation to persistence outages.
//!
//! ## Error Hierarchy
//!
//! `GatewayError` variants fall into three broad categories:
//!
//! 1. **Caller errors** - `Validation`, `NotFound`, `AlreadyExists`,
//!    `FailedPrecondition`, `Unauthenticated`, `PermissionDenied`.
//!    Surfaced directly with a stable category and never retried.
//!
//! 2. **Cancellation** - `Cancelled`, `DeadlineExceeded`. Produced when the
//!    caller disconnects or a per-operation deadline fires; every
//!    suspension point is expected to observe them promptly.
//!
//! 3. **Infrastructure errors** - `Unavailable`, `ResourceExhausted`,
//!    `Internal`. `Unavailable` carries a transient flag so caller-scoped
//!    operations can retry with backoff before giving up; background tasks
//!    log and continue.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Primary error type for the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Request failed schema or semantic validation.
    ///
    /// Rejected before any side effect takes place. The message is short
    /// and human-readable (e.g. "device_id is required").
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A uniqueness constraint was violated.
    #[error("{0} already exists")]
    AlreadyExists(&'static str),

    /// System state does not allow the operation.
    ///
    /// Example: a data stream attaching for a device without an active
    /// registered session.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A queue or rate limit was exceeded. Retryable by the caller.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation's deadline fired before it completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the operation (disconnect or explicit cancel).
    #[error("operation cancelled")]
    Cancelled,

    /// Persistence or a downstream dependency is unavailable.
    ///
    /// `transient` distinguishes retry-worthy conditions (connection lost,
    /// deadlock) from permanent ones (schema mismatch). Caller-scoped
    /// operations retry transient failures with exponential backoff up to
    /// a bounded budget, then surface this error.
    #[error("unavailable: {message}")]
    Unavailable { message: String, transient: bool },

    /// The caller did not present valid credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unexpected server-side fault (contained panic, invariant breach).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    /// Shorthand for a transient persistence outage.
    pub fn unavailable_transient(msg: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            message: msg.into(),
            transient: true,
        }
    }

    /// Shorthand for a permanent persistence failure.
    pub fn unavailable_permanent(msg: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            message: msg.into(),
            transient: false,
        }
    }

    /// Whether a bounded retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable { transient: true, .. })
    }

    /// Whether the error was produced by caller cancellation or deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            GatewayError::Cancelled | GatewayError::DeadlineExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::validation("device_id is required");
        assert_eq!(err.to_string(), "validation error: device_id is required");

        let err = GatewayError::NotFound("device");
        assert_eq!(err.to_string(), "device not found");
    }

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::unavailable_transient("connection reset").is_transient());
        assert!(!GatewayError::unavailable_permanent("relation missing").is_transient());
        assert!(!GatewayError::Cancelled.is_transient());
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(GatewayError::Cancelled.is_cancellation());
        assert!(GatewayError::DeadlineExceeded.is_cancellation());
        assert!(!GatewayError::validation("x").is_cancellation());
    }
}
