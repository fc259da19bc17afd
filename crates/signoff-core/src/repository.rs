//! Persistence gateway trait definitions.
//!
//! The gateway exclusively owns row writes; every other component mutates
//! data through it. Composite operations (create an approval AND park the
//! workflow, decide an approval AND advance the workflow) are single
//! transactions in the implementation, so commit is the unit of atomicity
//! and of lock hold.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use signoff_types::approval::{Approval, Decision};
use signoff_types::dlq::DlqEntry;
use signoff_types::error::{ApprovalError, RepositoryError};
use signoff_types::workflow::{
    NewWorkflow, Step, StepStatus, Workflow, WorkflowEvent, WorkflowState,
};

/// Result of a creation attempt that honors the idempotency key.
#[derive(Debug, Clone)]
pub struct CreatedWorkflow {
    pub workflow: Workflow,
    /// True when an existing row was returned instead of a new one. No
    /// `workflow.created` event is appended in that case.
    pub existing: bool,
}

/// Transactional gateway to the relational store.
///
/// Covers five entity families:
/// - **Workflows:** creation (idempotent), optimistic state transitions,
///   retry bookkeeping, abandonment.
/// - **Events:** append-only audit log.
/// - **Steps:** pipeline rows for multi-step workflows.
/// - **Approvals:** creation, locked decision writes, timeout, rollback.
/// - **DLQ:** append and operator triage.
pub trait OrchestratorRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Create a workflow (and its steps, if any) in one transaction,
    /// appending the `workflow.created` event. A repeated creation with the
    /// same `(workflow_type, idempotency_key)` returns the existing row.
    fn create_workflow(
        &self,
        new: &NewWorkflow,
    ) -> impl Future<Output = Result<CreatedWorkflow, RepositoryError>> + Send;

    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Conditionally move a workflow to `to` if `version == expected_version`,
    /// bumping the version and appending a `workflow.state_changed` event in
    /// the same transaction. Fails with `ConcurrentModification` on a
    /// version mismatch. The `(from, to)` pair is assumed validated by the
    /// state machine; the implementation re-checks it defensively against
    /// the row read inside the transaction.
    fn transition_workflow(
        &self,
        id: &Uuid,
        expected_version: i64,
        to: WorkflowState,
        event_payload: &serde_json::Value,
    ) -> impl Future<Output = Result<Workflow, RepositoryError>> + Send;

    /// Retry bookkeeping under the same version discipline: state back to
    /// RUNNING, `retry_count + 1`, `last_retry_at` stamped, the most recent
    /// failed step (if any) reset to pending, event appended.
    fn record_retry(
        &self,
        id: &Uuid,
        expected_version: i64,
    ) -> impl Future<Output = Result<Workflow, RepositoryError>> + Send;

    /// Workflows in TIMEOUT/FAILED with retries left, oldest first.
    fn list_retryable(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Workflows in TIMEOUT/FAILED whose retry budget is exhausted and that
    /// have not been abandoned yet.
    fn list_abandonable(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Stamp `abandoned_at` and write the DLQ entry in one transaction.
    fn mark_abandoned(
        &self,
        id: &Uuid,
        entry: &DlqEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append one event to a workflow's history.
    fn append_event(
        &self,
        workflow_id: &Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> impl Future<Output = Result<WorkflowEvent, RepositoryError>> + Send;

    /// Full history of a workflow, ordered by occurred-at.
    fn list_events(
        &self,
        workflow_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<WorkflowEvent>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Steps of a workflow ordered by `step_index`.
    fn list_steps(
        &self,
        workflow_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<Step>, RepositoryError>> + Send;

    fn update_step(
        &self,
        step_id: &Uuid,
        status: StepStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> impl Future<Output = Result<Step, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Insert the approval and transition its workflow to WAITING_APPROVAL
    /// (guarded on `expected_workflow_version`) in one transaction,
    /// appending the `approval.requested` and state-change events. When the
    /// approval carries a `step_id`, the step's back-reference is written in
    /// the same transaction.
    fn create_approval(
        &self,
        approval: &Approval,
        expected_workflow_version: i64,
    ) -> impl Future<Output = Result<(Approval, Workflow), RepositoryError>> + Send;

    fn get_approval(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    fn find_approval_by_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    /// Approvals of a workflow, newest first.
    fn list_approvals(
        &self,
        workflow_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;

    /// Record a decision under the pessimistic row lock (a writer
    /// transaction). Inside the transaction the approval is re-read and the
    /// expiry-before-status check re-applied, so a racing submit or timeout
    /// tick is decided by whoever commits first; the loser observes the new
    /// terminal status. On success the owning workflow moves to APPROVED or
    /// REJECTED and both events are appended.
    fn decide_approval(
        &self,
        id: &Uuid,
        decision: Decision,
        response_data: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(Approval, Workflow), ApprovalError>> + Send;

    /// Expire one approval under the same locking discipline. Returns
    /// `None` when a concurrent submit won the race (status no longer
    /// PENDING) and the row was left untouched.
    fn timeout_approval(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<(Approval, Workflow)>, RepositoryError>> + Send;

    /// Admin rollback: approval back to PENDING, workflow REJECTED ->
    /// RUNNING, owning step (if any) back to pending. Refused unless the
    /// approval holds a terminal decision and the workflow is REJECTED.
    fn reset_approval(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(Approval, Workflow), ApprovalError>> + Send;

    /// PENDING approvals past their expiry, oldest first, bounded.
    fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Dead-letter queue
    // -----------------------------------------------------------------------

    fn insert_dlq(
        &self,
        entry: &DlqEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn list_dlq(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<DlqEntry>, RepositoryError>> + Send;

    fn get_dlq(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<DlqEntry>, RepositoryError>> + Send;

    /// Delete one entry. Returns `true` if it existed.
    fn delete_dlq(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}
