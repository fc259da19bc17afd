//! Workflow state machine with optimistic versioning.
//!
//! Every persisted state change flows through [`StateMachine::transition`]:
//! it validates the edge against the transition table, delegates the
//! conditional write (version guard + event append, one transaction) to the
//! gateway, and publishes bus events strictly after commit. Version-on-every-
//! write plus the conditional update gives lost-update safety without coarse
//! locking, letting the timeout manager and the approval path run
//! concurrently without serializing.
//!
//! The privileged edges out of terminal states (`FAILED`/`TIMEOUT` ->
//! `RUNNING` via retry, `REJECTED` -> `RUNNING` via rollback) are refused on
//! the plain transition path and only reachable through [`StateMachine::retry`]
//! and the approval service's rollback.

use std::sync::Arc;

use uuid::Uuid;

use signoff_types::error::RepositoryError;
use signoff_types::event::OrchestratorEvent;
use signoff_types::workflow::{Workflow, WorkflowState};

use crate::event::EventBus;
use crate::repository::OrchestratorRepository;

// ---------------------------------------------------------------------------
// MachineError
// ---------------------------------------------------------------------------

/// Errors from state machine operations.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// The `(from, to)` pair is not in the transition table (or is a
    /// privileged edge taken on the plain path).
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    /// Version guard tripped: another writer committed first. Recovered
    /// locally by the caller, never surfaced to end users.
    #[error("concurrent modification on workflow {0}")]
    ConcurrentModification(Uuid),

    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// Retry refused: the budget is spent.
    #[error("retry budget exhausted ({count}/{max})")]
    RetriesExhausted { count: u32, max: u32 },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Validate an edge for the plain transition path.
pub fn validate_edge(from: WorkflowState, to: WorkflowState) -> Result<(), MachineError> {
    if !from.can_transition_to(to) || from.is_privileged_edge(to) {
        return Err(MachineError::InvalidTransition { from, to });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// Validated, versioned state transitions for workflows.
pub struct StateMachine<R> {
    repo: Arc<R>,
    bus: EventBus,
}

impl<R: OrchestratorRepository> StateMachine<R> {
    pub fn new(repo: Arc<R>, bus: EventBus) -> Self {
        Self { repo, bus }
    }

    /// Atomically move a workflow to `to` if its version still equals
    /// `expected_version`. On success the new row (version + 1) is returned
    /// and `workflow.state_changed` (plus `workflow.completed` /
    /// `workflow.failed` for those terminals) is published after commit.
    pub async fn transition(
        &self,
        workflow_id: &Uuid,
        to: WorkflowState,
        expected_version: i64,
        payload: serde_json::Value,
    ) -> Result<Workflow, MachineError> {
        let current = self
            .repo
            .get_workflow(workflow_id)
            .await?
            .ok_or(MachineError::NotFound(*workflow_id))?;

        if current.version != expected_version {
            return Err(MachineError::ConcurrentModification(*workflow_id));
        }
        validate_edge(current.state, to)?;

        let updated = match self
            .repo
            .transition_workflow(workflow_id, expected_version, to, &payload)
            .await
        {
            Ok(workflow) => workflow,
            Err(RepositoryError::ConcurrentModification) => {
                return Err(MachineError::ConcurrentModification(*workflow_id));
            }
            Err(RepositoryError::NotFound) => return Err(MachineError::NotFound(*workflow_id)),
            Err(err) => return Err(err.into()),
        };

        tracing::debug!(
            workflow_id = %workflow_id,
            from = %current.state,
            to = %to,
            version = updated.version,
            "workflow transitioned"
        );

        self.publish_transition(current.state, &updated, payload).await;
        Ok(updated)
    }

    /// Retry a FAILED or TIMEOUT workflow: state back to RUNNING,
    /// `retry_count + 1`, `last_retry_at` stamped. Refused when the state is
    /// anything else or the budget is spent.
    pub async fn retry(&self, workflow_id: &Uuid) -> Result<Workflow, MachineError> {
        let current = self
            .repo
            .get_workflow(workflow_id)
            .await?
            .ok_or(MachineError::NotFound(*workflow_id))?;

        if !matches!(
            current.state,
            WorkflowState::Failed | WorkflowState::Timeout
        ) {
            return Err(MachineError::InvalidTransition {
                from: current.state,
                to: WorkflowState::Running,
            });
        }
        if current.retry_count >= current.max_retries {
            return Err(MachineError::RetriesExhausted {
                count: current.retry_count,
                max: current.max_retries,
            });
        }

        let updated = match self.repo.record_retry(workflow_id, current.version).await {
            Ok(workflow) => workflow,
            Err(RepositoryError::ConcurrentModification) => {
                return Err(MachineError::ConcurrentModification(*workflow_id));
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!(
            workflow_id = %workflow_id,
            retry_count = updated.retry_count,
            max_retries = updated.max_retries,
            "workflow retried"
        );

        self.bus
            .publish(OrchestratorEvent::WorkflowStateChanged {
                workflow_id: *workflow_id,
                from: current.state,
                to: WorkflowState::Running,
                payload: serde_json::json!({
                    "reason": "retry",
                    "retry_count": updated.retry_count,
                }),
            })
            .await;

        Ok(updated)
    }

    async fn publish_transition(
        &self,
        from: WorkflowState,
        updated: &Workflow,
        payload: serde_json::Value,
    ) {
        self.bus
            .publish(OrchestratorEvent::WorkflowStateChanged {
                workflow_id: updated.id,
                from,
                to: updated.state,
                payload,
            })
            .await;

        match updated.state {
            WorkflowState::Completed => {
                self.bus
                    .publish(OrchestratorEvent::WorkflowCompleted {
                        workflow_id: updated.id,
                    })
                    .await;
            }
            WorkflowState::Failed => {
                self.bus
                    .publish(OrchestratorEvent::WorkflowFailed {
                        workflow_id: updated.id,
                        error: updated
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    })
                    .await;
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
