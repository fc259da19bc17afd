//! Approval service: request, decision intake, admin rollback.
//!
//! `submit` is the hardest operation in the kernel. Its check order is law:
//!
//! 1. token lookup -- `TokenInvalid` if unknown;
//! 2. expiry check FIRST -- `Expired` regardless of status;
//! 3. status check SECOND -- `AlreadyDecided` if not PENDING;
//! 4. persist the decision and advance the workflow, one transaction.
//!
//! Checking status before expiry would race the timeout scanner: a late
//! decision could appear to succeed against a workflow that has already
//! timed out. [`evaluate_decision`] encodes the ordering once; the service
//! applies it on its snapshot read and the gateway re-applies it inside the
//! decision transaction, which holds the pessimistic row lock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use signoff_types::approval::{Approval, ApprovalStatus, Decision, UiSchema};
use signoff_types::error::{ApprovalError, RepositoryError, TokenError};
use signoff_types::event::OrchestratorEvent;
use signoff_types::workflow::{Workflow, WorkflowState};

use crate::event::EventBus;
use crate::repository::OrchestratorRepository;

use super::token::CallbackTokenCodec;

/// Expiry-before-status validation for a decision attempt.
///
/// The ordering is non-negotiable; see the module docs.
pub fn evaluate_decision(approval: &Approval, now: DateTime<Utc>) -> Result<(), ApprovalError> {
    if now >= approval.expires_at {
        return Err(ApprovalError::Expired);
    }
    if approval.status != ApprovalStatus::Pending {
        return Err(ApprovalError::AlreadyDecided);
    }
    Ok(())
}

/// Human-approval lifecycle operations.
pub struct ApprovalService<R, C> {
    repo: Arc<R>,
    tokens: Arc<C>,
    bus: EventBus,
}

impl<R, C> ApprovalService<R, C>
where
    R: OrchestratorRepository,
    C: CallbackTokenCodec,
{
    pub fn new(repo: Arc<R>, tokens: Arc<C>, bus: EventBus) -> Self {
        Self { repo, tokens, bus }
    }

    /// Create a PENDING approval and park its workflow in WAITING_APPROVAL,
    /// all in one transaction. Publishes `approval.requested` after commit
    /// and returns the approval including the raw callback token.
    pub async fn request(
        &self,
        workflow_id: Uuid,
        step_id: Option<Uuid>,
        ui_schema: UiSchema,
        timeout_seconds: u64,
    ) -> Result<Approval, ApprovalError> {
        let workflow = self
            .repo
            .get_workflow(&workflow_id)
            .await?
            .ok_or(ApprovalError::Repository(RepositoryError::NotFound))?;

        let now = Utc::now();
        let expires_at = now + Duration::seconds(timeout_seconds.max(1) as i64);
        let approval_id = Uuid::now_v7();
        let token = match self.tokens.issue(&approval_id, expires_at) {
            Ok(token) => token,
            Err(TokenError::KeyMissing) => return Err(ApprovalError::SigningUnavailable),
            Err(TokenError::Invalid) => return Err(ApprovalError::TokenInvalid),
        };

        let approval = Approval {
            id: approval_id,
            workflow_id,
            step_id,
            ui_schema,
            status: ApprovalStatus::Pending,
            requested_at: now,
            expires_at,
            responded_at: None,
            decision: None,
            response_data: None,
            callback_token: token,
        };

        let (approval, parked) = self
            .repo
            .create_approval(&approval, workflow.version)
            .await?;

        tracing::info!(
            workflow_id = %workflow_id,
            approval_id = %approval.id,
            expires_at = %approval.expires_at,
            "approval requested"
        );

        self.bus
            .publish(OrchestratorEvent::WorkflowStateChanged {
                workflow_id,
                from: workflow.state,
                to: parked.state,
                payload: serde_json::json!({"approval_id": approval.id}),
            })
            .await;
        self.bus
            .publish(OrchestratorEvent::ApprovalRequested {
                workflow_id,
                approval_id: approval.id,
                expires_at: approval.expires_at,
            })
            .await;

        Ok(approval)
    }

    /// Record a decision arriving through a signed callback.
    ///
    /// Concurrent submits for the same token are serialized by the row
    /// lock; exactly one commits, the others observe `AlreadyDecided`.
    pub async fn submit(
        &self,
        token: &str,
        decision: Decision,
        response_data: serde_json::Value,
    ) -> Result<(Approval, Workflow), ApprovalError> {
        let claims = self
            .tokens
            .verify(token)
            .map_err(|_| ApprovalError::TokenInvalid)?;

        let approval = self
            .repo
            .find_approval_by_token(token)
            .await?
            .ok_or(ApprovalError::TokenInvalid)?;
        if approval.id != claims.approval_id {
            return Err(ApprovalError::TokenInvalid);
        }

        let now = Utc::now();
        // Snapshot check for a fast, lock-free rejection; the gateway
        // re-applies it inside the locked transaction.
        evaluate_decision(&approval, now)?;

        let (approval, workflow) = self
            .repo
            .decide_approval(&approval.id, decision, &response_data, now)
            .await?;

        tracing::info!(
            workflow_id = %workflow.id,
            approval_id = %approval.id,
            decision = decision.as_str(),
            "approval decision recorded"
        );

        self.bus
            .publish(OrchestratorEvent::WorkflowStateChanged {
                workflow_id: workflow.id,
                from: WorkflowState::WaitingApproval,
                to: workflow.state,
                payload: serde_json::json!({
                    "approval_id": approval.id,
                    "decision": decision.as_str(),
                }),
            })
            .await;
        self.bus
            .publish(OrchestratorEvent::ApprovalReceived {
                workflow_id: workflow.id,
                approval_id: approval.id,
                decision,
            })
            .await;

        Ok((approval, workflow))
    }

    /// Admin-only rollback of a rejected approval: the approval returns to
    /// PENDING, the workflow from REJECTED to RUNNING, and the executor
    /// resumes. Refused for COMPLETED workflows and undecided approvals.
    pub async fn rollback(
        &self,
        approval_id: Uuid,
    ) -> Result<(Approval, Workflow), ApprovalError> {
        let (approval, workflow) = self.repo.reset_approval(&approval_id, Utc::now()).await?;

        tracing::info!(
            workflow_id = %workflow.id,
            approval_id = %approval.id,
            "approval rolled back to pending"
        );

        self.bus
            .publish(OrchestratorEvent::WorkflowStateChanged {
                workflow_id: workflow.id,
                from: WorkflowState::Rejected,
                to: workflow.state,
                payload: serde_json::json!({
                    "approval_id": approval.id,
                    "reason": "rollback",
                }),
            })
            .await;
        self.bus
            .publish(OrchestratorEvent::WorkflowRollbackRequested {
                workflow_id: workflow.id,
                approval_id: approval.id,
            })
            .await;

        Ok((approval, workflow))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
