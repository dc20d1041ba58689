// File: errors.rs
// Purpose: error taxonomy shared by the flow engine and every persistence
// backend, plus the crate-wide `Result<T>` alias.
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by flow operations and persistence backends.
///
/// - `Validation`: malformed input, fatal to the current operation.
/// - `NotFound`: unknown entity, or one removed by a cascading delete.
/// - `Expired`: the flow's TTL elapsed; callers may offer a re-issue.
/// - `CsrfMismatch`: submitted token does not match the flow. Never retried.
/// - `Conflict`: token already redeemed or optimistic-concurrency failure.
/// - `BackendUnavailable`: storage connectivity problem.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("flow {flow_id} expired at {expired_at}")]
    Expired { flow_id: Uuid, expired_at: DateTime<Utc> },

    #[error("csrf token mismatch for flow {flow_id}")]
    CsrfMismatch { flow_id: Uuid },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Recoverable rejection from a strategy. The engine turns it into a
    /// re-render carrying an error message; it is not returned by `submit`.
    #[error("strategy {strategy} rejected submission for flow {flow_id}: {reason}")]
    Strategy { flow_id: Uuid, strategy: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// True when the caller may retry the operation with fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Conflict(_) | FlowError::BackendUnavailable(_))
    }

    /// Shorthand for the common "entity kind + id" not-found message.
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        FlowError::NotFound(format!("{} {}", kind, id))
    }
}

/// Result alias used across the crate APIs.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_only_for_conflict_and_backend() {
        assert!(FlowError::Conflict("x".into()).is_retryable());
        assert!(FlowError::BackendUnavailable("x".into()).is_retryable());
        assert!(!FlowError::CsrfMismatch { flow_id: Uuid::nil() }.is_retryable());
        assert!(!FlowError::not_found("flow", Uuid::nil()).is_retryable());
    }
}
