//! Workflow and step domain types.
//!
//! A `Workflow` is the durable unit of orchestration: it carries a JSON
//! context, a state driven exclusively through the state machine, and a
//! monotonically increasing `version` used as the optimistic concurrency
//! guard. Steps are the ordered units of a multi-step workflow, each either
//! a task (machine-executed) or an approval (human-decided).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::UiSchema;

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// State of a workflow within the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Created,
    Running,
    WaitingApproval,
    Approved,
    Completed,
    Rejected,
    Timeout,
    Failed,
}

impl WorkflowState {
    /// Terminal states are absorbing except via explicit rollback or retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed
                | WorkflowState::Rejected
                | WorkflowState::Timeout
                | WorkflowState::Failed
        )
    }

    /// Full transition table, including the privileged edges that are only
    /// reachable through retry (`FAILED`/`TIMEOUT` -> `RUNNING`) and
    /// rollback (`REJECTED` -> `RUNNING`). The state machine additionally
    /// refuses the privileged edges on its plain `transition` path.
    pub fn can_transition_to(self, to: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, to) {
            (Created, Running) | (Created, Failed) => true,
            (Running, WaitingApproval)
            | (Running, Running)
            | (Running, Completed)
            | (Running, Failed) => true,
            (WaitingApproval, Approved)
            | (WaitingApproval, Rejected)
            | (WaitingApproval, Timeout) => true,
            (Approved, Running) | (Approved, Completed) => true,
            // Privileged edges: rollback and retry.
            (Rejected, Running) => true,
            (Timeout, Running) | (Failed, Running) => true,
            // COMPLETED has no outgoing edges, not even rollback.
            _ => false,
        }
    }

    /// Edges that only retry or rollback may take.
    pub fn is_privileged_edge(self, to: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, to),
            (Rejected, Running) | (Timeout, Running) | (Failed, Running)
        )
    }

    /// Wire representation, e.g. `WAITING_APPROVAL`.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Created => "CREATED",
            WorkflowState::Running => "RUNNING",
            WorkflowState::WaitingApproval => "WAITING_APPROVAL",
            WorkflowState::Approved => "APPROVED",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Rejected => "REJECTED",
            WorkflowState::Timeout => "TIMEOUT",
            WorkflowState::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(WorkflowState::Created),
            "RUNNING" => Ok(WorkflowState::Running),
            "WAITING_APPROVAL" => Ok(WorkflowState::WaitingApproval),
            "APPROVED" => Ok(WorkflowState::Approved),
            "COMPLETED" => Ok(WorkflowState::Completed),
            "REJECTED" => Ok(WorkflowState::Rejected),
            "TIMEOUT" => Ok(WorkflowState::Timeout),
            "FAILED" => Ok(WorkflowState::Failed),
            other => Err(format!("unknown workflow state: '{other}'")),
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// How a failed workflow came to fail. Consulted by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A task handler raised or was unregistered.
    Handler,
    /// An approval expired before a decision arrived.
    Timeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Handler => "handler",
            FailureKind::Timeout => "timeout",
        }
    }
}

/// A durable workflow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    /// User-supplied type tag (e.g. "deployment").
    pub workflow_type: String,
    /// Arbitrary JSON carried through the workflow's lifetime.
    pub context: serde_json::Value,
    /// Current state; changed only through validated transitions.
    pub state: WorkflowState,
    /// Optimistic concurrency guard. Strictly increases by 1 per mutation.
    pub version: i64,
    /// Workflow-level retries consumed so far.
    pub retry_count: u32,
    /// Retry budget; exceeded workflows are abandoned to the DLQ.
    pub max_retries: u32,
    /// Whether this workflow has an explicit step pipeline.
    pub is_multi_step: bool,
    /// Dedup key, unique within `workflow_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Inline approval schema for single-step workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_schema: Option<UiSchema>,
    /// Approval expiry override for single-step workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_seconds: Option<u64>,
    /// Human-readable reason for the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Classification of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Set once when the retry budget is exhausted and the workflow is
    /// handed to the DLQ; scanned-over afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandoned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

/// Input for workflow creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub workflow_type: String,
    #[serde(default = "default_context")]
    pub context: serde_json::Value,
    /// Inline approval schema (single-step form).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_schema: Option<UiSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_seconds: Option<u64>,
    /// Explicit pipeline (multi-step form). Empty means single-step.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_context() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_max_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Workflow events (append-only audit log)
// ---------------------------------------------------------------------------

/// One row of a workflow's append-only history. Never mutated; the sequence
/// ordered by `occurred_at` is the authoritative record of what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Dotted event name, e.g. `workflow.state_changed`.
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The kind of step in a workflow pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Approval,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Task => "task",
            StepType::Approval => "approval",
        }
    }
}

/// Execution status of a step. A step moves pending -> running ->
/// (completed | failed); at most one step of a workflow is running at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// One ordered unit of a multi-step workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// 0-based position; dense and unique per workflow.
    pub step_index: u32,
    pub step_type: StepType,
    pub status: StepStatus,
    /// Registry name for task steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_handler: Option<String>,
    /// JSON input for task steps; the UI schema for approval steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Back-reference to the approval record of an approval step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    /// Per-step expiry override for approval steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Step definition supplied at workflow creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Task handler name (task steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Handler input (task steps) or UI schema (approval steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Per-step approval expiry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_seconds: Option<u64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
