//! Step executor: drives task/approval pipelines to completion.
//!
//! The executor reacts to bus events -- `workflow.created` to start,
//! `approval.received` to resume after a decision, and
//! `workflow.state_changed` into RUNNING from a terminal state to resume
//! after retry or rollback. Advancement itself is a loop over the stored
//! steps: the database, not a suspended stack, is the continuation.
//!
//! Two executor instances may race on the same workflow (e.g. a decision
//! arriving during a timer tick). Each claim of a step goes through the
//! workflow version guard (a RUNNING -> RUNNING bump); the losing instance
//! observes `ConcurrentModification`, logs, and exits, trusting the winner
//! to continue.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use signoff_types::approval::{ApprovalStatus, Decision, UiSchema};
use signoff_types::config::ApprovalConfig;
use signoff_types::error::{ApprovalError, RepositoryError, TaskError};
use signoff_types::event::{EventKind, OrchestratorEvent};
use signoff_types::workflow::{Step, StepStatus, StepType, Workflow, WorkflowState};

use crate::approval::service::ApprovalService;
use crate::approval::token::CallbackTokenCodec;
use crate::event::{EventBus, HandlerError};
use crate::repository::OrchestratorRepository;
use crate::task::TaskRegistry;

use super::machine::{MachineError, StateMachine};

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors from executor advancement. `ConcurrentModification` never reaches
/// this enum: the executor recovers from it locally by exiting.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Drives workflows forward, one claimed step at a time.
pub struct StepExecutor<R, C> {
    repo: Arc<R>,
    machine: Arc<StateMachine<R>>,
    approvals: Arc<ApprovalService<R, C>>,
    tasks: Arc<TaskRegistry>,
    bus: EventBus,
    approval_config: ApprovalConfig,
}

impl<R, C> StepExecutor<R, C>
where
    R: OrchestratorRepository + 'static,
    C: CallbackTokenCodec + 'static,
{
    pub fn new(
        repo: Arc<R>,
        machine: Arc<StateMachine<R>>,
        approvals: Arc<ApprovalService<R, C>>,
        tasks: Arc<TaskRegistry>,
        bus: EventBus,
        approval_config: ApprovalConfig,
    ) -> Self {
        Self {
            repo,
            machine,
            approvals,
            tasks,
            bus,
            approval_config,
        }
    }

    /// Register the executor's bus subscriptions.
    pub fn subscribe(self: &Arc<Self>) {
        let bus = self.bus.clone();

        let executor = Arc::clone(self);
        bus.subscribe(
            "executor.start",
            &[EventKind::WorkflowCreated],
            move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    if let OrchestratorEvent::WorkflowCreated { workflow_id, .. } = event {
                        executor
                            .start(workflow_id)
                            .await
                            .map_err(|e| HandlerError(e.to_string()))?;
                    }
                    Ok(())
                }
            },
        );

        let executor = Arc::clone(self);
        bus.subscribe(
            "executor.decision",
            &[EventKind::ApprovalReceived],
            move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    if let OrchestratorEvent::ApprovalReceived {
                        workflow_id,
                        approval_id,
                        decision,
                    } = event
                    {
                        executor
                            .on_decision(workflow_id, approval_id, decision)
                            .await
                            .map_err(|e| HandlerError(e.to_string()))?;
                    }
                    Ok(())
                }
            },
        );

        let executor = Arc::clone(self);
        bus.subscribe(
            "executor.resume",
            &[EventKind::WorkflowStateChanged],
            move |event| {
                let executor = Arc::clone(&executor);
                async move {
                    // Only retry and rollback resumptions re-enter here;
                    // ordinary RUNNING -> RUNNING advancement is driven
                    // inline and must not re-trigger itself.
                    if let OrchestratorEvent::WorkflowStateChanged {
                        workflow_id,
                        from,
                        to: WorkflowState::Running,
                        ..
                    } = event
                    {
                        if matches!(
                            from,
                            WorkflowState::Failed
                                | WorkflowState::Timeout
                                | WorkflowState::Rejected
                        ) {
                            executor
                                .resume(workflow_id)
                                .await
                                .map_err(|e| HandlerError(e.to_string()))?;
                        }
                    }
                    Ok(())
                }
            },
        );
    }

    /// Entry for `workflow.created`: move CREATED -> RUNNING and advance.
    pub async fn start(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        let Some(workflow) = self.repo.get_workflow(&workflow_id).await? else {
            return Ok(());
        };
        if workflow.state != WorkflowState::Created {
            tracing::debug!(workflow_id = %workflow_id, state = %workflow.state, "not in CREATED, skipping start");
            return Ok(());
        }

        let workflow = match self
            .machine
            .transition(
                &workflow_id,
                WorkflowState::Running,
                workflow.version,
                serde_json::json!({}),
            )
            .await
        {
            Ok(workflow) => workflow,
            Err(MachineError::ConcurrentModification(_)) => {
                tracing::debug!(workflow_id = %workflow_id, "lost the start race, exiting");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.run(workflow).await
    }

    /// Entry for `approval.received`.
    pub async fn on_decision(
        &self,
        workflow_id: Uuid,
        approval_id: Uuid,
        decision: Decision,
    ) -> Result<(), ExecutorError> {
        let Some(workflow) = self.repo.get_workflow(&workflow_id).await? else {
            return Ok(());
        };

        match decision {
            Decision::Reject => {
                // The decision transaction already moved the workflow to
                // REJECTED. Mark the owning step failed so the pipeline
                // records where it stopped; prior completed steps stay
                // completed.
                if workflow.is_multi_step {
                    if let Some(step) = self.find_step_for(&workflow_id, &approval_id).await? {
                        if step.status != StepStatus::Failed {
                            self.repo
                                .update_step(
                                    &step.id,
                                    StepStatus::Failed,
                                    None,
                                    Some("approval rejected"),
                                )
                                .await?;
                            self.bus
                                .publish(OrchestratorEvent::StepFailed {
                                    workflow_id,
                                    step_id: step.id,
                                    step_index: step.step_index,
                                    error: "approval rejected".to_string(),
                                })
                                .await;
                        }
                    }
                }
                Ok(())
            }
            Decision::Approve => {
                if workflow.state != WorkflowState::Approved {
                    tracing::debug!(
                        workflow_id = %workflow_id,
                        state = %workflow.state,
                        "stale approval event, workflow already advanced"
                    );
                    return Ok(());
                }

                if !workflow.is_multi_step {
                    match self
                        .machine
                        .transition(
                            &workflow_id,
                            WorkflowState::Completed,
                            workflow.version,
                            serde_json::json!({"approval_id": approval_id}),
                        )
                        .await
                    {
                        Ok(_) | Err(MachineError::ConcurrentModification(_)) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    }
                }

                if let Some(step) = self.find_step_for(&workflow_id, &approval_id).await? {
                    if step.status != StepStatus::Completed {
                        self.repo
                            .update_step(
                                &step.id,
                                StepStatus::Completed,
                                Some(&serde_json::json!({"decision": "approve"})),
                                None,
                            )
                            .await?;
                        self.bus
                            .publish(OrchestratorEvent::StepCompleted {
                                workflow_id,
                                step_id: step.id,
                                step_index: step.step_index,
                            })
                            .await;
                    }
                }

                let workflow = match self
                    .machine
                    .transition(
                        &workflow_id,
                        WorkflowState::Running,
                        workflow.version,
                        serde_json::json!({"resumed_by": "approval"}),
                    )
                    .await
                {
                    Ok(workflow) => workflow,
                    Err(MachineError::ConcurrentModification(_)) => {
                        tracing::debug!(workflow_id = %workflow_id, "lost the resume race, exiting");
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                };

                self.run(workflow).await
            }
        }
    }

    /// Entry for retry/rollback resumption: the workflow is back in RUNNING
    /// and the next non-completed step (or a fresh inline approval) runs.
    pub async fn resume(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        let Some(workflow) = self.repo.get_workflow(&workflow_id).await? else {
            return Ok(());
        };
        if workflow.state != WorkflowState::Running {
            return Ok(());
        }
        self.run(workflow).await
    }

    /// Advance a RUNNING workflow until it parks or terminates.
    async fn run(&self, workflow: Workflow) -> Result<(), ExecutorError> {
        if workflow.is_multi_step {
            self.run_pipeline(workflow).await
        } else {
            self.run_single(workflow).await
        }
    }

    /// Single-step workflows: request the inline approval, or complete
    /// immediately when there is none. A fresh approval (new token, new
    /// expiry) is minted every time the workflow re-enters RUNNING.
    async fn run_single(&self, workflow: Workflow) -> Result<(), ExecutorError> {
        match workflow.approval_schema.clone() {
            Some(schema) => {
                let timeout_seconds = workflow
                    .approval_timeout_seconds
                    .unwrap_or(self.approval_config.default_timeout_seconds);
                self.park_or_request(&workflow, None, schema, timeout_seconds)
                    .await
            }
            None => {
                match self
                    .machine
                    .transition(
                        &workflow.id,
                        WorkflowState::Completed,
                        workflow.version,
                        serde_json::json!({}),
                    )
                    .await
                {
                    Ok(_) | Err(MachineError::ConcurrentModification(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    async fn run_pipeline(&self, mut workflow: Workflow) -> Result<(), ExecutorError> {
        loop {
            let steps = self.repo.list_steps(&workflow.id).await?;
            let Some(step) = steps
                .into_iter()
                .find(|s| s.status != StepStatus::Completed)
            else {
                // Every step completed: the pipeline is done.
                match self
                    .machine
                    .transition(
                        &workflow.id,
                        WorkflowState::Completed,
                        workflow.version,
                        serde_json::json!({}),
                    )
                    .await
                {
                    Ok(_) | Err(MachineError::ConcurrentModification(_)) => return Ok(()),
                    Err(err) => return Err(err.into()),
                }
            };

            if step.status == StepStatus::Failed {
                // A task failure left over from a previous advancement.
                // (Rejected approvals move the workflow to REJECTED at
                // decision time and never reach this branch.)
                let error = step
                    .error
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string());
                match self
                    .machine
                    .transition(
                        &workflow.id,
                        WorkflowState::Failed,
                        workflow.version,
                        serde_json::json!({
                            "error": error,
                            "failure_kind": "handler",
                            "step_index": step.step_index,
                        }),
                    )
                    .await
                {
                    Ok(_) | Err(MachineError::ConcurrentModification(_)) => return Ok(()),
                    Err(err) => return Err(err.into()),
                }
            }

            // Claim the step under the workflow version guard. A step found
            // `running` (crash recovery, workflow retry) is re-executed;
            // handlers are idempotent within one advancement.
            workflow = match self
                .machine
                .transition(
                    &workflow.id,
                    WorkflowState::Running,
                    workflow.version,
                    serde_json::json!({"step_index": step.step_index}),
                )
                .await
            {
                Ok(workflow) => workflow,
                Err(MachineError::ConcurrentModification(_)) => {
                    tracing::debug!(
                        workflow_id = %workflow.id,
                        step_index = step.step_index,
                        "another executor claimed the step, exiting"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            let step = self
                .repo
                .update_step(&step.id, StepStatus::Running, None, None)
                .await?;
            self.bus
                .publish(OrchestratorEvent::StepStarted {
                    workflow_id: workflow.id,
                    step_id: step.id,
                    step_index: step.step_index,
                })
                .await;

            match step.step_type {
                StepType::Task => match self.run_task(&step).await {
                    Ok(output) => {
                        self.repo
                            .update_step(&step.id, StepStatus::Completed, Some(&output), None)
                            .await?;
                        self.bus
                            .publish(OrchestratorEvent::StepCompleted {
                                workflow_id: workflow.id,
                                step_id: step.id,
                                step_index: step.step_index,
                            })
                            .await;
                        tracing::debug!(
                            workflow_id = %workflow.id,
                            step_index = step.step_index,
                            "task step completed"
                        );
                        // Next step.
                    }
                    Err(err) => {
                        let error = err.to_string();
                        self.repo
                            .update_step(&step.id, StepStatus::Failed, None, Some(&error))
                            .await?;
                        self.bus
                            .publish(OrchestratorEvent::StepFailed {
                                workflow_id: workflow.id,
                                step_id: step.id,
                                step_index: step.step_index,
                                error: error.clone(),
                            })
                            .await;
                        match self
                            .machine
                            .transition(
                                &workflow.id,
                                WorkflowState::Failed,
                                workflow.version,
                                serde_json::json!({
                                    "error": error,
                                    "failure_kind": "handler",
                                    "step_index": step.step_index,
                                }),
                            )
                            .await
                        {
                            Ok(_) | Err(MachineError::ConcurrentModification(_)) => return Ok(()),
                            Err(err) => return Err(err.into()),
                        }
                    }
                },
                StepType::Approval => {
                    let schema = step
                        .task_input
                        .clone()
                        .and_then(|value| serde_json::from_value::<UiSchema>(value).ok())
                        .unwrap_or_else(|| {
                            UiSchema::titled(format!("Approve step {}", step.step_index + 1))
                        });
                    let timeout_seconds = step
                        .approval_timeout_seconds
                        .or(workflow.approval_timeout_seconds)
                        .unwrap_or(self.approval_config.default_timeout_seconds);

                    // Parked in WAITING_APPROVAL; the step stays `running`
                    // until the decision arrives.
                    return self
                        .park_or_request(&workflow, Some(&step), schema, timeout_seconds)
                        .await;
                }
            }
        }
    }

    /// Park the workflow on an approval. A rollback leaves the original
    /// approval PENDING with its token intact; in that case the workflow is
    /// re-parked on it instead of minting a second approval.
    async fn park_or_request(
        &self,
        workflow: &Workflow,
        step: Option<&Step>,
        schema: UiSchema,
        timeout_seconds: u64,
    ) -> Result<(), ExecutorError> {
        let now = Utc::now();
        let reusable = match step {
            Some(step) => match step.approval_id {
                Some(approval_id) => self
                    .repo
                    .get_approval(&approval_id)
                    .await?
                    .filter(|a| a.status == ApprovalStatus::Pending && a.expires_at > now),
                None => None,
            },
            None => self
                .repo
                .list_approvals(&workflow.id)
                .await?
                .into_iter()
                .find(|a| {
                    a.step_id.is_none()
                        && a.status == ApprovalStatus::Pending
                        && a.expires_at > now
                }),
        };

        if let Some(approval) = reusable {
            return match self
                .machine
                .transition(
                    &workflow.id,
                    WorkflowState::WaitingApproval,
                    workflow.version,
                    serde_json::json!({
                        "approval_id": approval.id,
                        "reason": "reattached",
                    }),
                )
                .await
            {
                Ok(_) | Err(MachineError::ConcurrentModification(_)) => Ok(()),
                Err(err) => Err(err.into()),
            };
        }

        match self
            .approvals
            .request(workflow.id, step.map(|s| s.id), schema, timeout_seconds)
            .await
        {
            Ok(_) => Ok(()),
            Err(ApprovalError::Repository(RepositoryError::ConcurrentModification)) => {
                tracing::debug!(workflow_id = %workflow.id, "lost the request race, exiting");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn run_task(&self, step: &Step) -> Result<serde_json::Value, TaskError> {
        let name = step
            .task_handler
            .as_deref()
            .ok_or_else(|| TaskError::UnknownHandler("<unset>".to_string()))?;
        let handler = self
            .tasks
            .get(name)
            .ok_or_else(|| TaskError::UnknownHandler(name.to_string()))?;
        let input = step
            .task_input
            .clone()
            .unwrap_or(serde_json::Value::Null);
        handler(input).await
    }

    async fn find_step_for(
        &self,
        workflow_id: &Uuid,
        approval_id: &Uuid,
    ) -> Result<Option<Step>, RepositoryError> {
        let steps = self.repo.list_steps(workflow_id).await?;
        Ok(steps
            .into_iter()
            .find(|s| s.approval_id.as_ref() == Some(approval_id)))
    }
}
