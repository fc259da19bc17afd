//! Orchestration kernel for Signoff.
//!
//! Five subsystems drive human-in-the-loop workflows to completion:
//!
//! - [`workflow::machine`] -- validated state transitions under an
//!   optimistic version guard, with event sourcing.
//! - [`workflow::executor`] -- drives sequential task/approval pipelines.
//! - [`approval`] -- token-signed callbacks, expiry-before-status decision
//!   intake, admin rollback.
//! - [`event`] -- in-process pub/sub with per-subscriber retry and a
//!   dead-letter queue.
//! - [`timeout`] -- background scanner that expires stalled approvals and
//!   schedules workflow retries.
//!
//! Persistence goes through the [`repository::OrchestratorRepository`]
//! trait; `signoff-infra` provides the SQLite implementation. The paused
//! state of a workflow is never a suspended stack: the database row
//! (`WAITING_APPROVAL` plus the pending approval) IS the continuation, and
//! resumption re-reads storage and advances.

pub mod approval;
pub mod event;
pub mod repository;
pub mod retry;
pub mod task;
pub mod timeout;
pub mod workflow;
