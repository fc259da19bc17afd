//! Callback token codec contract.
//!
//! A callback token is an opaque string bound to exactly one approval id and
//! its expiry, integrity-protected with a keyed MAC over the entire payload.
//! The kernel only depends on this trait; the HMAC-SHA256 implementation
//! lives in `signoff-infra`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use signoff_types::error::TokenError;

/// Claims recovered from a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    pub approval_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Mints and verifies callback tokens.
///
/// Verification MUST fail closed: with no signing key configured every call
/// returns [`TokenError::Invalid`], and any single-bit mutation of a token
/// invalidates it. Expiry enforcement is not the codec's job -- the approval
/// service checks the stored row, expiry before status.
pub trait CallbackTokenCodec: Send + Sync {
    /// Mint a token for an approval. Fails with [`TokenError::KeyMissing`]
    /// when no signing key is configured.
    fn issue(&self, approval_id: &Uuid, expires_at: DateTime<Utc>) -> Result<String, TokenError>;

    /// Verify a token and recover its claims.
    fn verify(&self, token: &str) -> Result<TokenClaims, TokenError>;
}
