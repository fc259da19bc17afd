//! Axum router configuration with middleware.
//!
//! REST routes live under `/api/v1/`. The signed decision callback sits at
//! `/callbacks/{token}` outside the REST namespace -- it is the URL handed
//! to external channels. Middleware: CORS and request tracing.

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflows
        .route("/workflows", post(handlers::workflow::create_workflow))
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route(
            "/workflows/{id}/events",
            get(handlers::workflow::list_events),
        )
        .route(
            "/workflows/{id}/approvals",
            post(handlers::approval::create_approval),
        )
        // Approvals
        .route("/approvals/{id}", get(handlers::approval::get_approval))
        .route(
            "/approvals/{id}/rollback",
            post(handlers::approval::rollback_approval),
        )
        // Dead-letter queue triage
        .route("/dlq", get(handlers::dlq::list_dlq))
        .route("/dlq/{id}/retry", post(handlers::dlq::retry_dlq))
        .route("/dlq/{id}", delete(handlers::dlq::delete_dlq));

    Router::new()
        .nest("/api/v1", api_routes)
        // The signed callback URL distributed to approval channels.
        .route(
            "/callbacks/{token}",
            post(handlers::callback::submit_callback),
        )
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
