//! Approval domain types.
//!
//! An approval is a human-decision record bound to a workflow (and, in
//! multi-step workflows, to a step). It carries a portable JSON UI schema
//! rendered by out-of-core adapters, an expiry, and an opaque signed
//! callback token through which the decision arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status and decision
// ---------------------------------------------------------------------------

/// Status of an approval. A terminal status is reached exactly once; only
/// the explicit rollback operation moves a row back out of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ApprovalStatus::Pending),
            "APPROVED" => Ok(ApprovalStatus::Approved),
            "REJECTED" => Ok(ApprovalStatus::Rejected),
            "TIMEOUT" => Ok(ApprovalStatus::Timeout),
            other => Err(format!("unknown approval status: '{other}'")),
        }
    }
}

/// A human decision submitted against an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Decision::Approve),
            "reject" => Ok(Decision::Reject),
            other => Err(format!("unknown decision: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// UI schema
// ---------------------------------------------------------------------------

/// Portable description of the approval form. Rendering per channel (web,
/// chat) is an adapter concern; the kernel only stores and transports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiSchema {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<UiField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<UiAction>,
}

impl UiSchema {
    /// Minimal schema with just a title.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            fields: Vec::new(),
            actions: Vec::new(),
        }
    }
}

/// One input field on the approval form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiField {
    pub name: String,
    pub label: String,
    #[serde(default = "default_field_type", rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
}

fn default_field_type() -> String {
    "text".to_string()
}

/// One action button on the approval form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiAction {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

// ---------------------------------------------------------------------------
// Approval record
// ---------------------------------------------------------------------------

/// A durable approval record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Owning step for multi-step workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    pub ui_schema: UiSchema,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    /// Always strictly after `requested_at`.
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<serde_json::Value>,
    /// Opaque signed token; unguessable, bound to this approval's id and
    /// expiry. Redacted from read-side API responses.
    pub callback_token: String,
}
