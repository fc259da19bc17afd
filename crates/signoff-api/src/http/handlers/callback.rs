//! Signed decision callback.
//!
//! `POST /callbacks/{token}` is the one endpoint a human's approval click
//! ultimately lands on, possibly days after the request and through a
//! different channel. Status mapping is part of the contract:
//!
//! - 200 decision accepted
//! - 401 token MAC invalid or no signing key configured
//! - 410 expired (always checked BEFORE 409)
//! - 409 already decided
//! - 422 decision value not in the permitted set

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use signoff_types::approval::Decision;
use signoff_types::error::ApprovalError;
use signoff_types::workflow::WorkflowState;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for a decision callback.
#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    pub decision: String,
    #[serde(default)]
    pub response_data: serde_json::Value,
}

/// Result of an accepted decision.
#[derive(Debug, Serialize)]
pub struct CallbackAccepted {
    pub approval_id: Uuid,
    pub workflow_id: Uuid,
    pub decision: Decision,
    pub workflow_state: WorkflowState,
}

/// POST /callbacks/:token - Record a human decision.
pub async fn submit_callback(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<CallbackBody>,
) -> Result<Json<ApiResponse<CallbackAccepted>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let decision: Decision = body
        .decision
        .parse()
        .map_err(|_| AppError::Approval(ApprovalError::InvalidDecision(body.decision.clone())))?;

    let (approval, workflow) = state
        .approvals
        .submit(&token, decision, body.response_data)
        .await?;

    Ok(Json(ApiResponse::success(
        CallbackAccepted {
            approval_id: approval.id,
            workflow_id: workflow.id,
            decision,
            workflow_state: workflow.state,
        },
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}
