//! Timeout manager: a background scanner for stalled approvals and
//! retryable workflows.
//!
//! One task, woken on a fixed interval. Each tick expires PENDING approvals
//! past their deadline (re-checking under the row lock -- a concurrent
//! submit that won the race makes the scanner skip), schedules retries for
//! TIMEOUT/FAILED workflows with backoff and jitter, and abandons workflows
//! whose retry budget is spent by writing a DLQ entry. A shutdown signal
//! lets the in-flight tick finish; no orphan transactions.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use signoff_types::config::TimeoutConfig;
use signoff_types::dlq::DlqEntry;
use signoff_types::event::OrchestratorEvent;
use signoff_types::workflow::{FailureKind, WorkflowState};

use crate::event::EventBus;
use crate::repository::OrchestratorRepository;
use crate::retry::retry_delay_with_jitter;
use crate::workflow::machine::{MachineError, StateMachine};

/// Periodic scanner driving approval expiry and workflow retries.
pub struct TimeoutManager<R> {
    repo: Arc<R>,
    machine: Arc<StateMachine<R>>,
    bus: EventBus,
    config: TimeoutConfig,
}

impl<R: OrchestratorRepository + 'static> TimeoutManager<R> {
    pub fn new(
        repo: Arc<R>,
        machine: Arc<StateMachine<R>>,
        bus: EventBus,
        config: TimeoutConfig,
    ) -> Self {
        Self {
            repo,
            machine,
            bus,
            config,
        }
    }

    /// Spawn the scan loop. Cancelling the token finishes the in-flight
    /// tick and exits.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                interval_secs = self.config.scan_interval.as_secs(),
                "timeout manager started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("timeout manager stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    /// One full scan. Public so tests can drive ticks directly.
    pub async fn tick(&self) {
        self.expire_approvals().await;
        self.retry_stalled().await;
        self.abandon_exhausted().await;
    }

    async fn expire_approvals(&self) {
        let now = Utc::now();
        let expired = match self
            .repo
            .list_expired_pending(now, self.config.batch_size)
            .await
        {
            Ok(expired) => expired,
            Err(err) => {
                tracing::warn!(error = %err, "expired-approval scan failed");
                return;
            }
        };

        for candidate in expired {
            match self.repo.timeout_approval(&candidate.id, now).await {
                Ok(Some((approval, workflow))) => {
                    tracing::info!(
                        workflow_id = %workflow.id,
                        approval_id = %approval.id,
                        "approval expired"
                    );
                    self.bus
                        .publish(OrchestratorEvent::WorkflowStateChanged {
                            workflow_id: workflow.id,
                            from: WorkflowState::WaitingApproval,
                            to: workflow.state,
                            payload: serde_json::json!({"approval_id": approval.id}),
                        })
                        .await;
                    self.bus
                        .publish(OrchestratorEvent::ApprovalTimeout {
                            workflow_id: workflow.id,
                            approval_id: approval.id,
                        })
                        .await;
                }
                Ok(None) => {
                    // A submit acquired the row lock first; nothing to do.
                    tracing::debug!(approval_id = %candidate.id, "decision won the race with expiry");
                }
                Err(err) => {
                    tracing::warn!(approval_id = %candidate.id, error = %err, "expiry write failed");
                }
            }
        }
    }

    async fn retry_stalled(&self) {
        let now = Utc::now();
        let candidates = match self.repo.list_retryable(self.config.batch_size).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(error = %err, "retryable-workflow scan failed");
                return;
            }
        };

        for workflow in candidates {
            if !self.config.task_failure_consumes_retry
                && workflow.failure_kind == Some(FailureKind::Handler)
            {
                tracing::debug!(
                    workflow_id = %workflow.id,
                    "handler failures configured as terminal, skipping retry"
                );
                continue;
            }

            let delay = retry_delay_with_jitter(
                self.config.retry_backoff_initial,
                self.config.retry_backoff_multiplier,
                workflow.retry_count,
            );
            let due_at = workflow.updated_at
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            if now < due_at {
                continue;
            }

            match self.machine.retry(&workflow.id).await {
                Ok(retried) => {
                    tracing::info!(
                        workflow_id = %retried.id,
                        retry_count = retried.retry_count,
                        "stalled workflow retried"
                    );
                }
                Err(
                    MachineError::ConcurrentModification(_)
                    | MachineError::RetriesExhausted { .. }
                    | MachineError::InvalidTransition { .. },
                ) => {
                    // Someone else moved the workflow since the scan read it.
                    tracing::debug!(workflow_id = %workflow.id, "retry skipped, state moved");
                }
                Err(err) => {
                    tracing::warn!(workflow_id = %workflow.id, error = %err, "retry failed");
                }
            }
        }
    }

    async fn abandon_exhausted(&self) {
        let candidates = match self.repo.list_abandonable(self.config.batch_size).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(error = %err, "abandonable-workflow scan failed");
                return;
            }
        };

        for workflow in candidates {
            let entry = DlqEntry::abandoned_workflow(
                workflow.id,
                workflow.state.as_str(),
                workflow.last_error.as_deref(),
                workflow.retry_count,
            );
            match self.repo.mark_abandoned(&workflow.id, &entry).await {
                Ok(()) => {
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        final_state = workflow.state.as_str(),
                        retry_count = workflow.retry_count,
                        "workflow abandoned after exhausting retries"
                    );
                }
                Err(err) => {
                    tracing::warn!(workflow_id = %workflow.id, error = %err, "abandon write failed");
                }
            }
        }
    }
}
