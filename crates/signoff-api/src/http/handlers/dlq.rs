//! Dead-letter queue triage handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use signoff_core::repository::OrchestratorRepository;
use signoff_types::dlq::DlqEntry;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Query parameters for listing DLQ entries.
#[derive(Debug, Deserialize)]
pub struct ListDlqQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// GET /api/v1/dlq - Dead-lettered events, newest first.
pub async fn list_dlq(
    State(state): State<AppState>,
    Query(query): Query<ListDlqQuery>,
) -> Result<Json<ApiResponse<Vec<DlqEntry>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let entries = state.repo.list_dlq(query.limit).await?;

    Ok(Json(ApiResponse::success(
        entries,
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// POST /api/v1/dlq/:id/retry - Re-publish a dead-lettered event.
///
/// The entry's serialized event goes back onto the bus; subscribers that
/// can now handle it succeed, anything still broken dead-letters again as
/// a fresh entry. The original entry is removed either way.
pub async fn retry_dlq(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let entry = state
        .repo
        .get_dlq(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dlq entry {id} not found")))?;

    let event: signoff_types::event::OrchestratorEvent =
        serde_json::from_value(entry.event_payload.clone()).map_err(|e| {
            AppError::Validation(format!("dlq entry payload is not a replayable event: {e}"))
        })?;

    state.bus.publish(event).await;
    state.repo.delete_dlq(&id).await?;
    tracing::info!(dlq_id = %id, event_type = entry.event_type.as_str(), "dead-lettered event replayed");

    Ok(Json(ApiResponse::success(
        serde_json::json!({"replayed": true, "id": id}),
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// DELETE /api/v1/dlq/:id - Discard one entry after triage.
pub async fn delete_dlq(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let deleted = state.repo.delete_dlq(&id).await?;
    if !deleted {
        return Err(AppError::NotFound(format!("dlq entry {id} not found")));
    }

    Ok(Json(ApiResponse::success(
        serde_json::json!({"deleted": true, "id": id}),
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}
