//! Workflow creation service.
//!
//! Validates the creation request, delegates the (idempotent) insert to the
//! gateway, and publishes `workflow.created` after commit -- but only for
//! genuinely new workflows: an idempotent replay returns the existing row
//! and emits nothing.

use std::sync::Arc;

use signoff_types::error::RepositoryError;
use signoff_types::event::OrchestratorEvent;
use signoff_types::workflow::{NewWorkflow, StepType};

use crate::event::EventBus;
use crate::repository::{CreatedWorkflow, OrchestratorRepository};

/// Errors from workflow creation.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowServiceError {
    /// Bad input; surfaced to the caller, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Creates workflows and announces them on the bus.
pub struct WorkflowService<R> {
    repo: Arc<R>,
    bus: EventBus,
}

impl<R: OrchestratorRepository> WorkflowService<R> {
    pub fn new(repo: Arc<R>, bus: EventBus) -> Self {
        Self { repo, bus }
    }

    /// Create a workflow, honoring the idempotency key. Repeated creation
    /// with the same `(workflow_type, idempotency_key)` returns the existing
    /// workflow and appends no new event.
    pub async fn create(
        &self,
        new: NewWorkflow,
    ) -> Result<CreatedWorkflow, WorkflowServiceError> {
        validate(&new)?;

        let created = self.repo.create_workflow(&new).await?;
        if created.existing {
            tracing::debug!(
                workflow_id = %created.workflow.id,
                idempotency_key = ?new.idempotency_key,
                "idempotent replay, returning existing workflow"
            );
            return Ok(created);
        }

        tracing::info!(
            workflow_id = %created.workflow.id,
            workflow_type = created.workflow.workflow_type.as_str(),
            is_multi_step = created.workflow.is_multi_step,
            "workflow created"
        );

        self.bus
            .publish(OrchestratorEvent::WorkflowCreated {
                workflow_id: created.workflow.id,
                workflow_type: created.workflow.workflow_type.clone(),
                is_multi_step: created.workflow.is_multi_step,
            })
            .await;

        Ok(created)
    }
}

fn validate(new: &NewWorkflow) -> Result<(), WorkflowServiceError> {
    if new.workflow_type.trim().is_empty() {
        return Err(WorkflowServiceError::Validation(
            "workflow_type must not be empty".to_string(),
        ));
    }
    if !new.steps.is_empty() && new.approval_schema.is_some() {
        return Err(WorkflowServiceError::Validation(
            "supply either an inline approval_schema or steps, not both".to_string(),
        ));
    }
    for (index, step) in new.steps.iter().enumerate() {
        if step.step_type == StepType::Task && step.handler.is_none() {
            return Err(WorkflowServiceError::Validation(format!(
                "step {index} is a task but names no handler"
            )));
        }
    }
    Ok(())
}
