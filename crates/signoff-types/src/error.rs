use thiserror::Error;

use crate::workflow::WorkflowState;

/// Errors from gateway operations (trait definitions live in signoff-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// Optimistic version guard tripped: another writer committed first.
    /// Recovered locally by the raising component, never surfaced to users.
    #[error("concurrent modification: version mismatch")]
    ConcurrentModification,
}

/// Errors from approval operations, mapped onto distinct HTTP statuses by
/// the callback endpoint (401 / 410 / 409 / 422).
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// Token failed verification, or no signing key is configured.
    #[error("callback token invalid")]
    TokenInvalid,

    /// `now >= expires_at`. Checked before the status, always.
    #[error("approval expired")]
    Expired,

    /// A decision was already recorded (status is not PENDING).
    #[error("approval already decided")]
    AlreadyDecided,

    #[error("approval not found")]
    NotFound,

    #[error("invalid decision: '{0}'")]
    InvalidDecision(String),

    /// Rollback refused, e.g. the workflow is COMPLETED or the approval is
    /// still pending.
    #[error("rollback not allowed: {0}")]
    RollbackNotAllowed(String),

    #[error("signing key not configured")]
    SigningUnavailable,

    #[error("workflow is in state {0}, cannot accept a decision")]
    WorkflowState(WorkflowState),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Errors from the callback token codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Covers malformed encoding, MAC mismatch, and the fail-closed case of
    /// a missing signing key; callers cannot distinguish them.
    #[error("callback token invalid")]
    Invalid,

    /// Issuance refused because no signing key is configured.
    #[error("signing key not configured")]
    KeyMissing,
}

/// Errors raised by task handlers. Any handler error is a permanent step
/// failure; retries happen at the workflow level only.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no task handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("task handler failed: {0}")]
    Failed(String),
}
