//! Shared domain types for the Signoff orchestration kernel.
//!
//! Everything here is plain data: workflow and step records, approval
//! records, the orchestrator event enum, dead-letter entries, error enums,
//! and policy configuration. Behavior lives in `signoff-core`; persistence
//! lives in `signoff-infra`.

pub mod approval;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod workflow;
