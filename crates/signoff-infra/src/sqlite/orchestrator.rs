//! SQLite implementation of the persistence gateway.
//!
//! Implements `OrchestratorRepository` from `signoff-core` using sqlx with
//! split read/write pools. Composite operations (approval creation,
//! decision writes, rollback, abandonment) each run in one transaction on
//! the single-connection writer pool: the transaction is the unit of
//! atomicity and, because the writer is serialized, the unit of exclusive
//! lock hold. Reads go to the WAL snapshot reader pool and never block a
//! writer.
//!
//! Workflow rows carry a monotonically increasing `version`; every state
//! write is a conditional `UPDATE ... WHERE version = ?`, so a lost race
//! surfaces as `ConcurrentModification` instead of a silent overwrite.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use signoff_core::approval::evaluate_decision;
use signoff_core::repository::{CreatedWorkflow, OrchestratorRepository};
use signoff_types::approval::{Approval, ApprovalStatus, Decision, UiSchema};
use signoff_types::dlq::DlqEntry;
use signoff_types::error::{ApprovalError, RepositoryError};
use signoff_types::workflow::{
    FailureKind, NewWorkflow, Step, StepSpec, StepStatus, StepType, Workflow, WorkflowEvent,
    WorkflowState,
};

use super::pool::DatabasePool;

/// SQLite-backed persistence gateway.
pub struct SqliteOrchestratorRepository {
    pool: DatabasePool,
}

impl SqliteOrchestratorRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn q(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(err.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so that textual ordering is chronological ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json(s: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid JSON: {e}")))
}

fn to_json_string(value: &serde_json::Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    workflow_type: String,
    context: String,
    state: String,
    version: i64,
    retry_count: i64,
    max_retries: i64,
    is_multi_step: i64,
    idempotency_key: Option<String>,
    approval_schema: Option<String>,
    approval_timeout_seconds: Option<i64>,
    last_error: Option<String>,
    failure_kind: Option<String>,
    abandoned_at: Option<String>,
    created_at: String,
    updated_at: String,
    last_retry_at: Option<String>,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_type: row.try_get("workflow_type")?,
            context: row.try_get("context")?,
            state: row.try_get("state")?,
            version: row.try_get("version")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            is_multi_step: row.try_get("is_multi_step")?,
            idempotency_key: row.try_get("idempotency_key")?,
            approval_schema: row.try_get("approval_schema")?,
            approval_timeout_seconds: row.try_get("approval_timeout_seconds")?,
            last_error: row.try_get("last_error")?,
            failure_kind: row.try_get("failure_kind")?,
            abandoned_at: row.try_get("abandoned_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_retry_at: row.try_get("last_retry_at")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        let state: WorkflowState = self
            .state
            .parse()
            .map_err(RepositoryError::Query)?;

        let approval_schema = self
            .approval_schema
            .as_deref()
            .map(|s| {
                serde_json::from_str::<UiSchema>(s).map_err(|e| {
                    RepositoryError::Query(format!("invalid approval_schema JSON: {e}"))
                })
            })
            .transpose()?;

        let failure_kind = match self.failure_kind.as_deref() {
            None => None,
            Some("handler") => Some(FailureKind::Handler),
            Some("timeout") => Some(FailureKind::Timeout),
            Some(other) => {
                return Err(RepositoryError::Query(format!(
                    "invalid failure_kind: '{other}'"
                )));
            }
        };

        Ok(Workflow {
            id: parse_uuid(&self.id)?,
            workflow_type: self.workflow_type,
            context: parse_json(&self.context)?,
            state,
            version: self.version,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            is_multi_step: self.is_multi_step != 0,
            idempotency_key: self.idempotency_key,
            approval_schema,
            approval_timeout_seconds: self.approval_timeout_seconds.map(|s| s as u64),
            last_error: self.last_error,
            failure_kind,
            abandoned_at: self.abandoned_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            last_retry_at: self.last_retry_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    id: String,
    workflow_id: String,
    step_index: i64,
    step_type: String,
    status: String,
    task_handler: Option<String>,
    task_input: Option<String>,
    task_output: Option<String>,
    error: Option<String>,
    approval_id: Option<String>,
    approval_timeout_seconds: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            step_index: row.try_get("step_index")?,
            step_type: row.try_get("step_type")?,
            status: row.try_get("status")?,
            task_handler: row.try_get("task_handler")?,
            task_input: row.try_get("task_input")?,
            task_output: row.try_get("task_output")?,
            error: row.try_get("error")?,
            approval_id: row.try_get("approval_id")?,
            approval_timeout_seconds: row.try_get("approval_timeout_seconds")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<Step, RepositoryError> {
        let step_type = match self.step_type.as_str() {
            "task" => StepType::Task,
            "approval" => StepType::Approval,
            other => {
                return Err(RepositoryError::Query(format!(
                    "invalid step_type: '{other}'"
                )));
            }
        };
        let status = match self.status.as_str() {
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            other => {
                return Err(RepositoryError::Query(format!(
                    "invalid step status: '{other}'"
                )));
            }
        };

        Ok(Step {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            step_index: self.step_index as u32,
            step_type,
            status,
            task_handler: self.task_handler,
            task_input: self.task_input.as_deref().map(parse_json).transpose()?,
            task_output: self.task_output.as_deref().map(parse_json).transpose()?,
            error: self.error,
            approval_id: self.approval_id.as_deref().map(parse_uuid).transpose()?,
            approval_timeout_seconds: self.approval_timeout_seconds.map(|s| s as u64),
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct ApprovalRow {
    id: String,
    workflow_id: String,
    step_id: Option<String>,
    ui_schema: String,
    status: String,
    requested_at: String,
    expires_at: String,
    responded_at: Option<String>,
    decision: Option<String>,
    response_data: Option<String>,
    callback_token: String,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            step_id: row.try_get("step_id")?,
            ui_schema: row.try_get("ui_schema")?,
            status: row.try_get("status")?,
            requested_at: row.try_get("requested_at")?,
            expires_at: row.try_get("expires_at")?,
            responded_at: row.try_get("responded_at")?,
            decision: row.try_get("decision")?,
            response_data: row.try_get("response_data")?,
            callback_token: row.try_get("callback_token")?,
        })
    }

    fn into_approval(self) -> Result<Approval, RepositoryError> {
        let status: ApprovalStatus = self
            .status
            .parse()
            .map_err(RepositoryError::Query)?;
        let decision = match self.decision.as_deref() {
            None => None,
            Some("approve") => Some(Decision::Approve),
            Some("reject") => Some(Decision::Reject),
            Some(other) => {
                return Err(RepositoryError::Query(format!(
                    "invalid decision: '{other}'"
                )));
            }
        };

        let ui_schema: UiSchema = serde_json::from_str(&self.ui_schema)
            .map_err(|e| RepositoryError::Query(format!("invalid ui_schema JSON: {e}")))?;

        Ok(Approval {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            step_id: self.step_id.as_deref().map(parse_uuid).transpose()?,
            ui_schema,
            status,
            requested_at: parse_datetime(&self.requested_at)?,
            expires_at: parse_datetime(&self.expires_at)?,
            responded_at: self.responded_at.as_deref().map(parse_datetime).transpose()?,
            decision,
            response_data: self.response_data.as_deref().map(parse_json).transpose()?,
            callback_token: self.callback_token,
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers
// ---------------------------------------------------------------------------

const WORKFLOW_COLUMNS: &str = "id, workflow_type, context, state, version, retry_count, \
     max_retries, is_multi_step, idempotency_key, approval_schema, \
     approval_timeout_seconds, last_error, failure_kind, abandoned_at, \
     created_at, updated_at, last_retry_at";

const APPROVAL_COLUMNS: &str = "id, workflow_id, step_id, ui_schema, status, requested_at, \
     expires_at, responded_at, decision, response_data, callback_token";

const STEP_COLUMNS: &str = "id, workflow_id, step_index, step_type, status, task_handler, \
     task_input, task_output, error, approval_id, approval_timeout_seconds, \
     created_at, updated_at";

async fn load_workflow_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &Uuid,
) -> Result<Option<Workflow>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(&mut **tx)
    .await
    .map_err(q)?;

    match row {
        Some(row) => {
            let parsed = WorkflowRow::from_row(&row).map_err(q)?;
            Ok(Some(parsed.into_workflow()?))
        }
        None => Ok(None),
    }
}

async fn load_approval_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &Uuid,
) -> Result<Option<Approval>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(&mut **tx)
    .await
    .map_err(q)?;

    match row {
        Some(row) => {
            let parsed = ApprovalRow::from_row(&row).map_err(q)?;
            Ok(Some(parsed.into_approval()?))
        }
        None => Ok(None),
    }
}

/// Conditional workflow state write: the optimistic version guard. Returns
/// the updated struct; a mismatched version yields `ConcurrentModification`.
async fn update_workflow_state_tx(
    tx: &mut Transaction<'_, Sqlite>,
    workflow: &Workflow,
    to: WorkflowState,
    now: DateTime<Utc>,
    last_error: Option<&str>,
    failure_kind: Option<FailureKind>,
) -> Result<Workflow, RepositoryError> {
    let result = sqlx::query(
        "UPDATE workflows SET state = ?, version = version + 1, updated_at = ?, \
         last_error = COALESCE(?, last_error), failure_kind = COALESCE(?, failure_kind) \
         WHERE id = ? AND version = ?",
    )
    .bind(to.as_str())
    .bind(format_datetime(&now))
    .bind(last_error)
    .bind(failure_kind.map(|k| k.as_str()))
    .bind(workflow.id.to_string())
    .bind(workflow.version)
    .execute(&mut **tx)
    .await
    .map_err(q)?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::ConcurrentModification);
    }

    let mut updated = workflow.clone();
    updated.state = to;
    updated.version += 1;
    updated.updated_at = now;
    if let Some(error) = last_error {
        updated.last_error = Some(error.to_string());
    }
    if let Some(kind) = failure_kind {
        updated.failure_kind = Some(kind);
    }
    Ok(updated)
}

async fn append_event_tx(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: &Uuid,
    event_type: &str,
    payload: &serde_json::Value,
    occurred_at: DateTime<Utc>,
) -> Result<WorkflowEvent, RepositoryError> {
    let event = WorkflowEvent {
        id: Uuid::now_v7(),
        workflow_id: *workflow_id,
        event_type: event_type.to_string(),
        payload: payload.clone(),
        occurred_at,
    };

    sqlx::query(
        "INSERT INTO workflow_events (id, workflow_id, event_type, payload, occurred_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(event.id.to_string())
    .bind(event.workflow_id.to_string())
    .bind(&event.event_type)
    .bind(to_json_string(&event.payload)?)
    .bind(format_datetime(&event.occurred_at))
    .execute(&mut **tx)
    .await
    .map_err(q)?;

    Ok(event)
}

fn state_changed_payload(
    from: WorkflowState,
    to: WorkflowState,
    payload: &serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "from": from.as_str(),
        "to": to.as_str(),
        "payload": payload,
    })
}

async fn insert_step_tx(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: &Uuid,
    index: u32,
    spec: &StepSpec,
    now: DateTime<Utc>,
) -> Result<Step, RepositoryError> {
    let step = Step {
        id: Uuid::now_v7(),
        workflow_id: *workflow_id,
        step_index: index,
        step_type: spec.step_type,
        status: StepStatus::Pending,
        task_handler: spec.handler.clone(),
        task_input: spec.input.clone(),
        task_output: None,
        error: None,
        approval_id: None,
        approval_timeout_seconds: spec.approval_timeout_seconds,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO steps (id, workflow_id, step_index, step_type, status, task_handler, \
         task_input, approval_timeout_seconds, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(step.id.to_string())
    .bind(step.workflow_id.to_string())
    .bind(step.step_index as i64)
    .bind(step.step_type.as_str())
    .bind(step.status.as_str())
    .bind(&step.task_handler)
    .bind(
        step.task_input
            .as_ref()
            .map(to_json_string)
            .transpose()?,
    )
    .bind(step.approval_timeout_seconds.map(|s| s as i64))
    .bind(format_datetime(&step.created_at))
    .bind(format_datetime(&step.updated_at))
    .execute(&mut **tx)
    .await
    .map_err(q)?;

    Ok(step)
}

// ---------------------------------------------------------------------------
// OrchestratorRepository impl
// ---------------------------------------------------------------------------

impl OrchestratorRepository for SqliteOrchestratorRepository {
    async fn create_workflow(
        &self,
        new: &NewWorkflow,
    ) -> Result<CreatedWorkflow, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        if let Some(key) = &new.idempotency_key {
            let existing = sqlx::query(&format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows \
                 WHERE workflow_type = ? AND idempotency_key = ?"
            ))
            .bind(&new.workflow_type)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(q)?;

            if let Some(row) = existing {
                let workflow = WorkflowRow::from_row(&row).map_err(q)?.into_workflow()?;
                tx.commit().await.map_err(q)?;
                return Ok(CreatedWorkflow {
                    workflow,
                    existing: true,
                });
            }
        }

        let now = Utc::now();
        let is_multi_step = !new.steps.is_empty();
        let workflow = Workflow {
            id: Uuid::now_v7(),
            workflow_type: new.workflow_type.clone(),
            context: new.context.clone(),
            state: WorkflowState::Created,
            version: 1,
            retry_count: 0,
            max_retries: new.max_retries,
            is_multi_step,
            idempotency_key: new.idempotency_key.clone(),
            approval_schema: new.approval_schema.clone(),
            approval_timeout_seconds: new.approval_timeout_seconds,
            last_error: None,
            failure_kind: None,
            abandoned_at: None,
            created_at: now,
            updated_at: now,
            last_retry_at: None,
        };

        sqlx::query(
            "INSERT INTO workflows (id, workflow_type, context, state, version, retry_count, \
             max_retries, is_multi_step, idempotency_key, approval_schema, \
             approval_timeout_seconds, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.workflow_type)
        .bind(to_json_string(&workflow.context)?)
        .bind(workflow.state.as_str())
        .bind(workflow.version)
        .bind(workflow.retry_count as i64)
        .bind(workflow.max_retries as i64)
        .bind(workflow.is_multi_step as i64)
        .bind(&workflow.idempotency_key)
        .bind(
            workflow
                .approval_schema
                .as_ref()
                .map(|s| serde_json::to_string(s).map_err(|e| RepositoryError::Query(e.to_string())))
                .transpose()?,
        )
        .bind(workflow.approval_timeout_seconds.map(|s| s as i64))
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(q)?;

        for (index, spec) in new.steps.iter().enumerate() {
            insert_step_tx(&mut tx, &workflow.id, index as u32, spec, now).await?;
        }

        append_event_tx(
            &mut tx,
            &workflow.id,
            "workflow.created",
            &serde_json::json!({
                "workflow_type": workflow.workflow_type,
                "is_multi_step": workflow.is_multi_step,
            }),
            now,
        )
        .await?;

        tx.commit().await.map_err(q)?;
        Ok(CreatedWorkflow {
            workflow,
            existing: false,
        })
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(q)?;

        match row {
            Some(row) => Ok(Some(WorkflowRow::from_row(&row).map_err(q)?.into_workflow()?)),
            None => Ok(None),
        }
    }

    async fn transition_workflow(
        &self,
        id: &Uuid,
        expected_version: i64,
        to: WorkflowState,
        event_payload: &serde_json::Value,
    ) -> Result<Workflow, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        let workflow = load_workflow_tx(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if workflow.version != expected_version {
            return Err(RepositoryError::ConcurrentModification);
        }
        // The state machine validated the edge; re-check against the row
        // actually read inside the transaction.
        if !workflow.state.can_transition_to(to) {
            return Err(RepositoryError::Conflict(format!(
                "transition {} -> {} not allowed",
                workflow.state, to
            )));
        }

        let now = Utc::now();
        let (last_error, failure_kind) = if to == WorkflowState::Failed {
            let error = event_payload.get("error").and_then(|v| v.as_str());
            let kind = match event_payload.get("failure_kind").and_then(|v| v.as_str()) {
                Some("handler") => Some(FailureKind::Handler),
                Some("timeout") => Some(FailureKind::Timeout),
                _ => None,
            };
            (error, kind)
        } else {
            (None, None)
        };

        let updated =
            update_workflow_state_tx(&mut tx, &workflow, to, now, last_error, failure_kind)
                .await?;

        append_event_tx(
            &mut tx,
            id,
            "workflow.state_changed",
            &state_changed_payload(workflow.state, to, event_payload),
            now,
        )
        .await?;

        tx.commit().await.map_err(q)?;
        Ok(updated)
    }

    async fn record_retry(
        &self,
        id: &Uuid,
        expected_version: i64,
    ) -> Result<Workflow, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        let workflow = load_workflow_tx(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if workflow.version != expected_version {
            return Err(RepositoryError::ConcurrentModification);
        }
        if !matches!(
            workflow.state,
            WorkflowState::Failed | WorkflowState::Timeout
        ) {
            return Err(RepositoryError::Conflict(format!(
                "retry from {} not allowed",
                workflow.state
            )));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE workflows SET state = ?, version = version + 1, \
             retry_count = retry_count + 1, last_retry_at = ?, updated_at = ? \
             WHERE id = ? AND version = ?",
        )
        .bind(WorkflowState::Running.as_str())
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(q)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::ConcurrentModification);
        }

        // Give the most recent failed step another chance; the executor
        // re-runs it on resumption.
        sqlx::query(
            "UPDATE steps SET status = 'pending', error = NULL, updated_at = ? \
             WHERE id = (SELECT id FROM steps WHERE workflow_id = ? AND status = 'failed' \
                         ORDER BY step_index DESC LIMIT 1)",
        )
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(q)?;

        append_event_tx(
            &mut tx,
            id,
            "workflow.state_changed",
            &state_changed_payload(
                workflow.state,
                WorkflowState::Running,
                &serde_json::json!({"reason": "retry", "retry_count": workflow.retry_count + 1}),
            ),
            now,
        )
        .await?;

        tx.commit().await.map_err(q)?;

        let mut updated = workflow;
        updated.state = WorkflowState::Running;
        updated.version += 1;
        updated.retry_count += 1;
        updated.last_retry_at = Some(now);
        updated.updated_at = now;
        Ok(updated)
    }

    async fn list_retryable(&self, limit: u32) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows \
             WHERE state IN ('TIMEOUT', 'FAILED') AND retry_count < max_retries \
             AND abandoned_at IS NULL \
             ORDER BY updated_at ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(q)?;

        rows.iter()
            .map(|row| WorkflowRow::from_row(row).map_err(q)?.into_workflow())
            .collect()
    }

    async fn list_abandonable(&self, limit: u32) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows \
             WHERE state IN ('TIMEOUT', 'FAILED') AND retry_count >= max_retries \
             AND abandoned_at IS NULL \
             ORDER BY updated_at ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(q)?;

        rows.iter()
            .map(|row| WorkflowRow::from_row(row).map_err(q)?.into_workflow())
            .collect()
    }

    async fn mark_abandoned(
        &self,
        id: &Uuid,
        entry: &DlqEntry,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE workflows SET abandoned_at = ?, updated_at = ? \
             WHERE id = ? AND abandoned_at IS NULL",
        )
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(q)?;

        if result.rows_affected() == 0 {
            // Already abandoned by a previous tick; nothing to record.
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO dlq_entries (id, event_type, event_payload, error, retry_count, \
             workflow_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.event_type)
        .bind(to_json_string(&entry.event_payload)?)
        .bind(&entry.error)
        .bind(entry.retry_count as i64)
        .bind(entry.workflow_id.map(|id| id.to_string()))
        .bind(format_datetime(&entry.created_at))
        .execute(&mut *tx)
        .await
        .map_err(q)?;

        tx.commit().await.map_err(q)?;
        Ok(())
    }

    async fn append_event(
        &self,
        workflow_id: &Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<WorkflowEvent, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;
        let event = append_event_tx(&mut tx, workflow_id, event_type, payload, Utc::now()).await?;
        tx.commit().await.map_err(q)?;
        Ok(event)
    }

    async fn list_events(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Vec<WorkflowEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, event_type, payload, occurred_at FROM workflow_events \
             WHERE workflow_id = ? ORDER BY occurred_at ASC, id ASC",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(q)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(q)?;
                let workflow_id: String = row.try_get("workflow_id").map_err(q)?;
                let event_type: String = row.try_get("event_type").map_err(q)?;
                let payload: String = row.try_get("payload").map_err(q)?;
                let occurred_at: String = row.try_get("occurred_at").map_err(q)?;
                Ok(WorkflowEvent {
                    id: parse_uuid(&id)?,
                    workflow_id: parse_uuid(&workflow_id)?,
                    event_type,
                    payload: parse_json(&payload)?,
                    occurred_at: parse_datetime(&occurred_at)?,
                })
            })
            .collect()
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE workflow_id = ? ORDER BY step_index ASC"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(q)?;

        rows.iter()
            .map(|row| StepRow::from_row(row).map_err(q)?.into_step())
            .collect()
    }

    async fn update_step(
        &self,
        step_id: &Uuid,
        status: StepStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<Step, RepositoryError> {
        let now = Utc::now();
        let output_json = output.map(to_json_string).transpose()?;
        let result = sqlx::query(
            "UPDATE steps SET status = ?, task_output = COALESCE(?, task_output), \
             error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(output_json)
        .bind(error)
        .bind(format_datetime(&now))
        .bind(step_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(q)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?"))
            .bind(step_id.to_string())
            .fetch_one(&self.pool.writer)
            .await
            .map_err(q)?;
        StepRow::from_row(&row).map_err(q)?.into_step()
    }

    async fn create_approval(
        &self,
        approval: &Approval,
        expected_workflow_version: i64,
    ) -> Result<(Approval, Workflow), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        let workflow = load_workflow_tx(&mut tx, &approval.workflow_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if workflow.version != expected_workflow_version {
            return Err(RepositoryError::ConcurrentModification);
        }
        if !workflow
            .state
            .can_transition_to(WorkflowState::WaitingApproval)
        {
            return Err(RepositoryError::Conflict(format!(
                "cannot request approval while workflow is {}",
                workflow.state
            )));
        }

        sqlx::query(
            "INSERT INTO approvals (id, workflow_id, step_id, ui_schema, status, requested_at, \
             expires_at, callback_token) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(approval.id.to_string())
        .bind(approval.workflow_id.to_string())
        .bind(approval.step_id.map(|id| id.to_string()))
        .bind(
            serde_json::to_string(&approval.ui_schema)
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
        )
        .bind(approval.status.as_str())
        .bind(format_datetime(&approval.requested_at))
        .bind(format_datetime(&approval.expires_at))
        .bind(&approval.callback_token)
        .execute(&mut *tx)
        .await
        .map_err(q)?;

        if let Some(step_id) = approval.step_id {
            sqlx::query("UPDATE steps SET approval_id = ?, updated_at = ? WHERE id = ?")
                .bind(approval.id.to_string())
                .bind(format_datetime(&approval.requested_at))
                .bind(step_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(q)?;
        }

        let now = approval.requested_at;
        let updated = update_workflow_state_tx(
            &mut tx,
            &workflow,
            WorkflowState::WaitingApproval,
            now,
            None,
            None,
        )
        .await?;

        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "workflow.state_changed",
            &state_changed_payload(
                workflow.state,
                WorkflowState::WaitingApproval,
                &serde_json::json!({"approval_id": approval.id}),
            ),
            now,
        )
        .await?;
        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "approval.requested",
            &serde_json::json!({
                "approval_id": approval.id,
                "step_id": approval.step_id,
                "expires_at": format_datetime(&approval.expires_at),
            }),
            now,
        )
        .await?;

        tx.commit().await.map_err(q)?;
        Ok((approval.clone(), updated))
    }

    async fn get_approval(&self, id: &Uuid) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(q)?;

        match row {
            Some(row) => Ok(Some(ApprovalRow::from_row(&row).map_err(q)?.into_approval()?)),
            None => Ok(None),
        }
    }

    async fn find_approval_by_token(
        &self,
        token: &str,
    ) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE callback_token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(q)?;

        match row {
            Some(row) => Ok(Some(ApprovalRow::from_row(&row).map_err(q)?.into_approval()?)),
            None => Ok(None),
        }
    }

    async fn list_approvals(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE workflow_id = ? \
             ORDER BY requested_at DESC"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(q)?;

        rows.iter()
            .map(|row| ApprovalRow::from_row(row).map_err(q)?.into_approval())
            .collect()
    }

    async fn decide_approval(
        &self,
        id: &Uuid,
        decision: Decision,
        response_data: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(Approval, Workflow), ApprovalError> {
        // The writer transaction is the pessimistic lock: no other decision
        // or timeout write can interleave until commit.
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        let approval = load_approval_tx(&mut tx, id)
            .await?
            .ok_or(ApprovalError::NotFound)?;

        // Authoritative re-check under the lock, expiry before status. A
        // racing submit or timeout tick that committed first is observed
        // here as Expired / AlreadyDecided.
        evaluate_decision(&approval, now)?;

        let (new_status, workflow_state) = match decision {
            Decision::Approve => (ApprovalStatus::Approved, WorkflowState::Approved),
            Decision::Reject => (ApprovalStatus::Rejected, WorkflowState::Rejected),
        };

        sqlx::query(
            "UPDATE approvals SET status = ?, decision = ?, responded_at = ?, \
             response_data = ? WHERE id = ?",
        )
        .bind(new_status.as_str())
        .bind(decision.as_str())
        .bind(format_datetime(&now))
        .bind(to_json_string(response_data)?)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(q)?;

        let workflow = load_workflow_tx(&mut tx, &approval.workflow_id)
            .await?
            .ok_or(ApprovalError::Repository(RepositoryError::NotFound))?;
        if workflow.state != WorkflowState::WaitingApproval {
            return Err(ApprovalError::WorkflowState(workflow.state));
        }

        let updated =
            update_workflow_state_tx(&mut tx, &workflow, workflow_state, now, None, None)
                .await
                .map_err(ApprovalError::Repository)?;

        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "approval.received",
            &serde_json::json!({
                "approval_id": approval.id,
                "decision": decision.as_str(),
            }),
            now,
        )
        .await?;
        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "workflow.state_changed",
            &state_changed_payload(
                workflow.state,
                workflow_state,
                &serde_json::json!({
                    "approval_id": approval.id,
                    "decision": decision.as_str(),
                }),
            ),
            now,
        )
        .await?;

        tx.commit().await.map_err(q)?;

        let mut decided = approval;
        decided.status = new_status;
        decided.decision = Some(decision);
        decided.responded_at = Some(now);
        decided.response_data = Some(response_data.clone());
        Ok((decided, updated))
    }

    async fn timeout_approval(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<(Approval, Workflow)>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        let approval = load_approval_tx(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        // Re-check under the lock: a concurrent submit may have won.
        if approval.status != ApprovalStatus::Pending || now < approval.expires_at {
            return Ok(None);
        }

        sqlx::query("UPDATE approvals SET status = 'TIMEOUT', responded_at = ? WHERE id = ?")
            .bind(format_datetime(&now))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(q)?;

        let workflow = load_workflow_tx(&mut tx, &approval.workflow_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if workflow.state != WorkflowState::WaitingApproval {
            // Inconsistent pairing; leave the workflow alone.
            tracing::warn!(
                approval_id = %id,
                workflow_id = %workflow.id,
                state = %workflow.state,
                "pending approval on a workflow not waiting for approval"
            );
            return Ok(None);
        }

        let updated = update_workflow_state_tx(
            &mut tx,
            &workflow,
            WorkflowState::Timeout,
            now,
            Some("approval timed out"),
            Some(FailureKind::Timeout),
        )
        .await?;

        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "approval.timeout",
            &serde_json::json!({"approval_id": approval.id}),
            now,
        )
        .await?;
        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "workflow.state_changed",
            &state_changed_payload(
                workflow.state,
                WorkflowState::Timeout,
                &serde_json::json!({"approval_id": approval.id}),
            ),
            now,
        )
        .await?;

        tx.commit().await.map_err(q)?;

        let mut expired = approval;
        expired.status = ApprovalStatus::Timeout;
        expired.responded_at = Some(now);
        Ok(Some((expired, updated)))
    }

    async fn reset_approval(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Approval, Workflow), ApprovalError> {
        let mut tx = self.pool.writer.begin().await.map_err(q)?;

        let approval = load_approval_tx(&mut tx, id)
            .await?
            .ok_or(ApprovalError::NotFound)?;
        if approval.status == ApprovalStatus::Pending {
            return Err(ApprovalError::RollbackNotAllowed(
                "approval has no decision to roll back".to_string(),
            ));
        }

        let workflow = load_workflow_tx(&mut tx, &approval.workflow_id)
            .await?
            .ok_or(ApprovalError::Repository(RepositoryError::NotFound))?;
        match workflow.state {
            WorkflowState::Rejected => {}
            WorkflowState::Completed => {
                // Whether unwinding completed work is meaningful is a product
                // decision that has not been made; refuse rather than guess.
                return Err(ApprovalError::RollbackNotAllowed(
                    "workflow is COMPLETED".to_string(),
                ));
            }
            other => {
                return Err(ApprovalError::RollbackNotAllowed(format!(
                    "workflow is {other}, only REJECTED can be rolled back"
                )));
            }
        }

        sqlx::query(
            "UPDATE approvals SET status = 'PENDING', decision = NULL, responded_at = NULL, \
             response_data = NULL WHERE id = ?",
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(q)?;

        if let Some(step_id) = approval.step_id {
            sqlx::query(
                "UPDATE steps SET status = 'pending', error = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(format_datetime(&now))
            .bind(step_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(q)?;
        }

        let updated = update_workflow_state_tx(
            &mut tx,
            &workflow,
            WorkflowState::Running,
            now,
            None,
            None,
        )
        .await
        .map_err(ApprovalError::Repository)?;

        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "workflow.rollback_requested",
            &serde_json::json!({"approval_id": approval.id}),
            now,
        )
        .await?;
        append_event_tx(
            &mut tx,
            &approval.workflow_id,
            "workflow.state_changed",
            &state_changed_payload(
                workflow.state,
                WorkflowState::Running,
                &serde_json::json!({"approval_id": approval.id, "reason": "rollback"}),
            ),
            now,
        )
        .await?;

        tx.commit().await.map_err(q)?;

        let mut reset = approval;
        reset.status = ApprovalStatus::Pending;
        reset.decision = None;
        reset.responded_at = None;
        reset.response_data = None;
        Ok((reset, updated))
    }

    async fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals \
             WHERE status = 'PENDING' AND expires_at <= ? \
             ORDER BY expires_at ASC LIMIT ?"
        ))
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(q)?;

        rows.iter()
            .map(|row| ApprovalRow::from_row(row).map_err(q)?.into_approval())
            .collect()
    }

    async fn insert_dlq(&self, entry: &DlqEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO dlq_entries (id, event_type, event_payload, error, retry_count, \
             workflow_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.event_type)
        .bind(to_json_string(&entry.event_payload)?)
        .bind(&entry.error)
        .bind(entry.retry_count as i64)
        .bind(entry.workflow_id.map(|id| id.to_string()))
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(q)?;
        Ok(())
    }

    async fn list_dlq(&self, limit: u32) -> Result<Vec<DlqEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, event_type, event_payload, error, retry_count, workflow_id, created_at \
             FROM dlq_entries ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(q)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(q)?;
                let event_type: String = row.try_get("event_type").map_err(q)?;
                let event_payload: String = row.try_get("event_payload").map_err(q)?;
                let error: String = row.try_get("error").map_err(q)?;
                let retry_count: i64 = row.try_get("retry_count").map_err(q)?;
                let workflow_id: Option<String> = row.try_get("workflow_id").map_err(q)?;
                let created_at: String = row.try_get("created_at").map_err(q)?;
                Ok(DlqEntry {
                    id: parse_uuid(&id)?,
                    event_type,
                    event_payload: parse_json(&event_payload)?,
                    error,
                    retry_count: retry_count as u32,
                    workflow_id: workflow_id.as_deref().map(parse_uuid).transpose()?,
                    created_at: parse_datetime(&created_at)?,
                })
            })
            .collect()
    }

    async fn get_dlq(&self, id: &Uuid) -> Result<Option<DlqEntry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, event_type, event_payload, error, retry_count, workflow_id, created_at \
             FROM dlq_entries WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(q)?;

        match row {
            Some(row) => {
                let entry_id: String = row.try_get("id").map_err(q)?;
                let event_type: String = row.try_get("event_type").map_err(q)?;
                let event_payload: String = row.try_get("event_payload").map_err(q)?;
                let error: String = row.try_get("error").map_err(q)?;
                let retry_count: i64 = row.try_get("retry_count").map_err(q)?;
                let workflow_id: Option<String> = row.try_get("workflow_id").map_err(q)?;
                let created_at: String = row.try_get("created_at").map_err(q)?;
                Ok(Some(DlqEntry {
                    id: parse_uuid(&entry_id)?,
                    event_type,
                    event_payload: parse_json(&event_payload)?,
                    error,
                    retry_count: retry_count as u32,
                    workflow_id: workflow_id.as_deref().map(parse_uuid).transpose()?,
                    created_at: parse_datetime(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_dlq(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM dlq_entries WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(q)?;
        Ok(result.rows_affected() > 0)
    }

}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
