//! Application error type mapping to HTTP status codes.
//!
//! The callback contract pins the statuses: 401 for an invalid token (or a
//! missing signing key), 410 for expiry, 409 for an already-decided
//! approval (expiry is always checked before the status, so a late
//! decision reads 410 rather than 409), and 422 for a decision value
//! outside the permitted set.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use signoff_core::workflow::WorkflowServiceError;
use signoff_types::error::{ApprovalError, RepositoryError};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Approval-flow errors with contract-pinned statuses.
    Approval(ApprovalError),
    /// Bad input.
    Validation(String),
    /// Missing entity.
    NotFound(String),
    /// Everything else.
    Internal(String),
}

impl From<ApprovalError> for AppError {
    fn from(err: ApprovalError) -> Self {
        AppError::Approval(err)
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => AppError::NotFound("not found".to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<WorkflowServiceError> for AppError {
    fn from(err: WorkflowServiceError) -> Self {
        match err {
            WorkflowServiceError::Validation(msg) => AppError::Validation(msg),
            WorkflowServiceError::Repository(repo) => repo.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Approval(ApprovalError::TokenInvalid) => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_INVALID",
                "Callback token invalid".to_string(),
            ),
            AppError::Approval(ApprovalError::SigningUnavailable) => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_INVALID",
                "Signing key not configured".to_string(),
            ),
            AppError::Approval(ApprovalError::Expired) => (
                StatusCode::GONE,
                "APPROVAL_EXPIRED",
                "Approval expired before the decision arrived".to_string(),
            ),
            AppError::Approval(ApprovalError::AlreadyDecided) => (
                StatusCode::CONFLICT,
                "ALREADY_DECIDED",
                "A decision was already recorded for this approval".to_string(),
            ),
            AppError::Approval(ApprovalError::InvalidDecision(value)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_DECISION",
                format!("Decision '{value}' is not in the permitted set"),
            ),
            AppError::Approval(ApprovalError::NotFound) => (
                StatusCode::NOT_FOUND,
                "APPROVAL_NOT_FOUND",
                "Approval not found".to_string(),
            ),
            AppError::Approval(ApprovalError::RollbackNotAllowed(reason)) => (
                StatusCode::CONFLICT,
                "ROLLBACK_NOT_ALLOWED",
                format!("Rollback not allowed: {reason}"),
            ),
            AppError::Approval(ApprovalError::WorkflowState(state)) => (
                StatusCode::CONFLICT,
                "WORKFLOW_STATE",
                format!("Workflow is in state {state}"),
            ),
            AppError::Approval(ApprovalError::Repository(err)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "REPOSITORY_ERROR",
                err.to_string(),
            ),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn callback_statuses_match_the_contract() {
        assert_eq!(
            status_of(AppError::Approval(ApprovalError::TokenInvalid)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(AppError::Approval(ApprovalError::SigningUnavailable)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(AppError::Approval(ApprovalError::Expired)),
            StatusCode::GONE
        );
        assert_eq!(
            status_of(AppError::Approval(ApprovalError::AlreadyDecided)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(AppError::Approval(ApprovalError::InvalidDecision(
                "maybe".to_string()
            ))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn repository_not_found_maps_to_404() {
        assert_eq!(
            status_of(AppError::from(RepositoryError::NotFound)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(AppError::from(RepositoryError::Query("x".to_string()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
