//! HMAC-SHA256 callback token codec.
//!
//! Token layout, before base64url (no padding) encoding:
//!
//! ```text
//! approval_id (16 bytes) || expires_at unix seconds (8 bytes, BE) || HMAC-SHA256 tag (32 bytes)
//! ```
//!
//! The MAC covers the entire payload, so the token is bound to exactly one
//! approval id and expiry; flipping any bit invalidates it. Verification is
//! constant-time via the hmac crate's `verify_slice` and fails closed: with
//! no signing key configured every call returns `TokenError::Invalid`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use uuid::Uuid;

use signoff_core::approval::token::{CallbackTokenCodec, TokenClaims};
use signoff_types::error::TokenError;

type HmacSha256 = Hmac<Sha256>;

const ID_LEN: usize = 16;
const EXPIRY_LEN: usize = 8;
const TAG_LEN: usize = 32;
const TOKEN_LEN: usize = ID_LEN + EXPIRY_LEN + TAG_LEN;

/// Callback token codec keyed by `SIGNING_KEY`.
pub struct HmacCallbackTokens {
    key: Option<SecretString>,
}

impl HmacCallbackTokens {
    /// `None` means no signing key is configured: issuance fails with
    /// `KeyMissing` and every verification fails closed with `Invalid`.
    pub fn new(key: Option<SecretString>) -> Self {
        Self { key }
    }

    fn mac(&self, payload: &[u8]) -> Result<HmacSha256, TokenError> {
        let key = self.key.as_ref().ok_or(TokenError::Invalid)?;
        let mut mac = HmacSha256::new_from_slice(key.expose_secret().as_bytes())
            .map_err(|_| TokenError::Invalid)?;
        mac.update(payload);
        Ok(mac)
    }
}

impl CallbackTokenCodec for HmacCallbackTokens {
    fn issue(&self, approval_id: &Uuid, expires_at: DateTime<Utc>) -> Result<String, TokenError> {
        if self.key.is_none() {
            return Err(TokenError::KeyMissing);
        }

        let mut payload = Vec::with_capacity(TOKEN_LEN);
        payload.extend_from_slice(approval_id.as_bytes());
        payload.extend_from_slice(&expires_at.timestamp().to_be_bytes());

        let tag = self.mac(&payload)?.finalize().into_bytes();
        payload.extend_from_slice(&tag);
        Ok(URL_SAFE_NO_PAD.encode(payload))
    }

    fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        // Fail closed before touching the token at all.
        if self.key.is_none() {
            return Err(TokenError::Invalid);
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TokenError::Invalid)?;
        if bytes.len() != TOKEN_LEN {
            return Err(TokenError::Invalid);
        }

        let (payload, tag) = bytes.split_at(ID_LEN + EXPIRY_LEN);
        self.mac(payload)?
            .verify_slice(tag)
            .map_err(|_| TokenError::Invalid)?;

        let approval_id = Uuid::from_slice(&payload[..ID_LEN]).map_err(|_| TokenError::Invalid)?;
        let seconds = i64::from_be_bytes(
            payload[ID_LEN..].try_into().map_err(|_| TokenError::Invalid)?,
        );
        let expires_at = DateTime::from_timestamp(seconds, 0).ok_or(TokenError::Invalid)?;

        Ok(TokenClaims {
            approval_id,
            expires_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
