//! Dead-letter queue entries.
//!
//! An entry is written when event delivery to a subscriber exhausts its
//! retries, or when a workflow exhausts its retry budget and is abandoned.
//! Entries are retained until an operator deletes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::OrchestratorEvent;

/// One dead-lettered event, with the terminal error for triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    /// Dotted wire name of the original event.
    pub event_type: String,
    /// Full serialized event payload.
    pub event_payload: serde_json::Value,
    /// The last error observed before giving up.
    pub error: String,
    /// Delivery attempts consumed before dead-lettering.
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl DlqEntry {
    /// Build an entry from a failed bus delivery.
    pub fn from_event(event: &OrchestratorEvent, error: String, retry_count: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event.kind().as_str().to_string(),
            event_payload: serde_json::to_value(event)
                .unwrap_or(serde_json::Value::Null),
            error,
            retry_count,
            workflow_id: Some(event.workflow_id()),
            created_at: Utc::now(),
        }
    }

    /// Build an entry for an abandoned workflow (retry budget exhausted).
    pub fn abandoned_workflow(
        workflow_id: Uuid,
        final_state: &str,
        last_error: Option<&str>,
        retry_count: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: "workflow.abandoned".to_string(),
            event_payload: serde_json::json!({
                "workflow_id": workflow_id,
                "final_state": final_state,
                "last_error": last_error,
            }),
            error: last_error
                .map(str::to_string)
                .unwrap_or_else(|| "retry budget exhausted".to_string()),
            retry_count,
            workflow_id: Some(workflow_id),
            created_at: Utc::now(),
        }
    }
}
