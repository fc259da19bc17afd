//! Approval intake: signed callback tokens, decision recording, rollback.

pub mod service;
pub mod token;

pub use service::{ApprovalService, evaluate_decision};
pub use token::{CallbackTokenCodec, TokenClaims};
