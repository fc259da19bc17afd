//! Workflow creation and read handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Serialize;
use uuid::Uuid;

use signoff_core::repository::OrchestratorRepository;
use signoff_types::workflow::{NewWorkflow, Step, Workflow, WorkflowEvent};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Workflow snapshot plus its pipeline steps.
#[derive(Debug, Serialize)]
pub struct WorkflowView {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub steps: Vec<Step>,
}

/// POST /api/v1/workflows - Create a workflow (single- or multi-step).
///
/// The `Idempotency-Key` header is equivalent to the `idempotency_key`
/// field; repeated creation with the same key returns the existing
/// workflow.
pub async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<NewWorkflow>,
) -> Result<Json<ApiResponse<WorkflowView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    if body.idempotency_key.is_none() {
        if let Some(key) = headers
            .get("Idempotency-Key")
            .and_then(|value| value.to_str().ok())
        {
            body.idempotency_key = Some(key.to_string());
        }
    }

    let created = state.workflows.create(body).await?;
    let steps = state.repo.list_steps(&created.workflow.id).await?;

    Ok(Json(ApiResponse::success(
        WorkflowView {
            workflow: created.workflow,
            steps,
        },
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// GET /api/v1/workflows/:id - Workflow snapshot with steps.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow = state
        .repo
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;
    let steps = state.repo.list_steps(&id).await?;

    Ok(Json(ApiResponse::success(
        WorkflowView { workflow, steps },
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// GET /api/v1/workflows/:id/events - The append-only history.
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<WorkflowEvent>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state
        .repo
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;
    let events = state.repo.list_events(&id).await?;

    Ok(Json(ApiResponse::success(
        events,
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}
