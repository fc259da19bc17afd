//! Orchestrator events delivered through the in-process bus.
//!
//! Events are a tagged variant: `EventKind` is the subscription key, and
//! `OrchestratorEvent` carries the typed payload. The serialized form uses
//! dotted wire names (`workflow.state_changed`) so bus events, the
//! append-only audit log, and DLQ entries all speak the same vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::Decision;
use crate::workflow::WorkflowState;

// ---------------------------------------------------------------------------
// EventKind (subscription key)
// ---------------------------------------------------------------------------

/// Discriminant of an orchestrator event, used to key bus subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    WorkflowCreated,
    WorkflowStateChanged,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowRollbackRequested,
    ApprovalRequested,
    ApprovalReceived,
    ApprovalTimeout,
    StepStarted,
    StepCompleted,
    StepFailed,
}

impl EventKind {
    /// Dotted wire name, e.g. `approval.requested`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WorkflowCreated => "workflow.created",
            EventKind::WorkflowStateChanged => "workflow.state_changed",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowFailed => "workflow.failed",
            EventKind::WorkflowRollbackRequested => "workflow.rollback_requested",
            EventKind::ApprovalRequested => "approval.requested",
            EventKind::ApprovalReceived => "approval.received",
            EventKind::ApprovalTimeout => "approval.timeout",
            EventKind::StepStarted => "step.started",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepFailed => "step.failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OrchestratorEvent
// ---------------------------------------------------------------------------

/// A lifecycle event published on the orchestrator bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorEvent {
    #[serde(rename = "workflow.created")]
    WorkflowCreated {
        workflow_id: Uuid,
        workflow_type: String,
        is_multi_step: bool,
    },
    #[serde(rename = "workflow.state_changed")]
    WorkflowStateChanged {
        workflow_id: Uuid,
        from: WorkflowState,
        to: WorkflowState,
        #[serde(default)]
        payload: serde_json::Value,
    },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { workflow_id: Uuid },
    #[serde(rename = "workflow.failed")]
    WorkflowFailed { workflow_id: Uuid, error: String },
    #[serde(rename = "workflow.rollback_requested")]
    WorkflowRollbackRequested {
        workflow_id: Uuid,
        approval_id: Uuid,
    },
    #[serde(rename = "approval.requested")]
    ApprovalRequested {
        workflow_id: Uuid,
        approval_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "approval.received")]
    ApprovalReceived {
        workflow_id: Uuid,
        approval_id: Uuid,
        decision: Decision,
    },
    #[serde(rename = "approval.timeout")]
    ApprovalTimeout {
        workflow_id: Uuid,
        approval_id: Uuid,
    },
    #[serde(rename = "step.started")]
    StepStarted {
        workflow_id: Uuid,
        step_id: Uuid,
        step_index: u32,
    },
    #[serde(rename = "step.completed")]
    StepCompleted {
        workflow_id: Uuid,
        step_id: Uuid,
        step_index: u32,
    },
    #[serde(rename = "step.failed")]
    StepFailed {
        workflow_id: Uuid,
        step_id: Uuid,
        step_index: u32,
        error: String,
    },
}

impl OrchestratorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            OrchestratorEvent::WorkflowCreated { .. } => EventKind::WorkflowCreated,
            OrchestratorEvent::WorkflowStateChanged { .. } => EventKind::WorkflowStateChanged,
            OrchestratorEvent::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            OrchestratorEvent::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            OrchestratorEvent::WorkflowRollbackRequested { .. } => {
                EventKind::WorkflowRollbackRequested
            }
            OrchestratorEvent::ApprovalRequested { .. } => EventKind::ApprovalRequested,
            OrchestratorEvent::ApprovalReceived { .. } => EventKind::ApprovalReceived,
            OrchestratorEvent::ApprovalTimeout { .. } => EventKind::ApprovalTimeout,
            OrchestratorEvent::StepStarted { .. } => EventKind::StepStarted,
            OrchestratorEvent::StepCompleted { .. } => EventKind::StepCompleted,
            OrchestratorEvent::StepFailed { .. } => EventKind::StepFailed,
        }
    }

    /// The workflow this event belongs to.
    pub fn workflow_id(&self) -> Uuid {
        match self {
            OrchestratorEvent::WorkflowCreated { workflow_id, .. }
            | OrchestratorEvent::WorkflowStateChanged { workflow_id, .. }
            | OrchestratorEvent::WorkflowCompleted { workflow_id }
            | OrchestratorEvent::WorkflowFailed { workflow_id, .. }
            | OrchestratorEvent::WorkflowRollbackRequested { workflow_id, .. }
            | OrchestratorEvent::ApprovalRequested { workflow_id, .. }
            | OrchestratorEvent::ApprovalReceived { workflow_id, .. }
            | OrchestratorEvent::ApprovalTimeout { workflow_id, .. }
            | OrchestratorEvent::StepStarted { workflow_id, .. }
            | OrchestratorEvent::StepCompleted { workflow_id, .. }
            | OrchestratorEvent::StepFailed { workflow_id, .. } => *workflow_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_uses_dotted_tags() {
        let event = OrchestratorEvent::ApprovalRequested {
            workflow_id: Uuid::now_v7(),
            approval_id: Uuid::now_v7(),
            expires_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"approval.requested\""));
        let parsed: OrchestratorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), EventKind::ApprovalRequested);
    }

    #[test]
    fn kind_matches_wire_name() {
        let event = OrchestratorEvent::WorkflowStateChanged {
            workflow_id: Uuid::now_v7(),
            from: WorkflowState::Running,
            to: WorkflowState::WaitingApproval,
            payload: serde_json::json!({}),
        };
        assert_eq!(event.kind().as_str(), "workflow.state_changed");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(event.kind().as_str()));
    }

    #[test]
    fn workflow_id_is_extracted_from_every_variant() {
        let id = Uuid::now_v7();
        let events = [
            OrchestratorEvent::WorkflowCompleted { workflow_id: id },
            OrchestratorEvent::WorkflowFailed {
                workflow_id: id,
                error: "boom".to_string(),
            },
            OrchestratorEvent::StepStarted {
                workflow_id: id,
                step_id: Uuid::now_v7(),
                step_index: 0,
            },
        ];
        for event in events {
            assert_eq!(event.workflow_id(), id);
        }
    }

    #[test]
    fn state_changed_payload_defaults_to_null() {
        let json = format!(
            r#"{{"type":"workflow.state_changed","workflow_id":"{}","from":"CREATED","to":"RUNNING"}}"#,
            Uuid::now_v7()
        );
        let parsed: OrchestratorEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            OrchestratorEvent::WorkflowStateChanged { payload, .. } => {
                assert!(payload.is_null())
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
