//! Approval creation, read, and rollback handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use signoff_core::repository::OrchestratorRepository;
use signoff_types::approval::{Approval, ApprovalStatus, Decision, UiSchema};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for creating an approval on a workflow.
#[derive(Debug, Deserialize)]
pub struct CreateApprovalBody {
    pub ui_schema: UiSchema,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Response for a freshly created approval: the only surface that ever
/// exposes the raw callback token.
#[derive(Debug, Serialize)]
pub struct CreatedApproval {
    pub id: Uuid,
    pub callback_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Read-side approval view: the stored record minus the raw token.
#[derive(Debug, Serialize)]
pub struct ApprovalView {
    pub id: Uuid,
    pub workflow_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    pub ui_schema: UiSchema,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<serde_json::Value>,
}

impl From<Approval> for ApprovalView {
    fn from(approval: Approval) -> Self {
        Self {
            id: approval.id,
            workflow_id: approval.workflow_id,
            step_id: approval.step_id,
            ui_schema: approval.ui_schema,
            status: approval.status,
            requested_at: approval.requested_at,
            expires_at: approval.expires_at,
            responded_at: approval.responded_at,
            decision: approval.decision,
            response_data: approval.response_data,
        }
    }
}

/// POST /api/v1/workflows/:id/approvals - Request an approval.
pub async fn create_approval(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(body): Json<CreateApprovalBody>,
) -> Result<Json<ApiResponse<CreatedApproval>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let timeout_seconds = body
        .timeout_seconds
        .unwrap_or(state.config.approval.default_timeout_seconds);
    let approval = state
        .approvals
        .request(workflow_id, None, body.ui_schema, timeout_seconds)
        .await?;

    Ok(Json(ApiResponse::success(
        CreatedApproval {
            id: approval.id,
            callback_token: approval.callback_token,
            expires_at: approval.expires_at,
        },
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// GET /api/v1/approvals/:id - Stored record, token redacted.
pub async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ApprovalView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let approval = state
        .repo
        .get_approval(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("approval {id} not found")))?;

    Ok(Json(ApiResponse::success(
        approval.into(),
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// POST /api/v1/approvals/:id/rollback - Admin rollback of a rejection.
pub async fn rollback_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ApprovalView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let (approval, _) = state.approvals.rollback(id).await?;

    Ok(Json(ApiResponse::success(
        approval.into(),
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}
