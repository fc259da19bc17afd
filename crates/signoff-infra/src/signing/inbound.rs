//! Signing-secret validator for inbound adapter payloads.
//!
//! Chat platforms sign their callbacks with a shared secret over a
//! timestamped base string (`v0:{timestamp}:{body}`). The validator
//! recomputes the HMAC-SHA256 and compares constant-time, and rejects
//! payloads whose timestamp is more than five minutes away from now --
//! replayed requests fail even with a valid signature. With no secret
//! configured, every verification fails closed.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock distance between the signed timestamp and now.
pub const SIGNATURE_FRESHNESS_SECS: i64 = 300;

/// Errors from inbound signature verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    /// No signing secret configured; verification fails closed.
    #[error("signing secret not configured")]
    SecretMissing,

    /// Timestamp outside the freshness window (replay protection).
    #[error("signature timestamp outside the freshness window")]
    StaleTimestamp,

    /// Recomputed MAC does not match the header.
    #[error("signature mismatch")]
    Mismatch,

    /// Signature header is not well-formed hex.
    #[error("malformed signature header")]
    Malformed,
}

/// Verifies platform-signed inbound payloads.
pub struct InboundSignatureValidator {
    secret: Option<SecretString>,
}

impl InboundSignatureValidator {
    pub fn new(secret: Option<SecretString>) -> Self {
        Self { secret }
    }

    /// Verify `signature_header` against `timestamp` (UTC seconds) and the
    /// raw request body, as of `now`.
    ///
    /// The header may carry a `v0=` prefix (platform convention); both
    /// prefixed and bare hex are accepted.
    pub fn verify(
        &self,
        timestamp: i64,
        body: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::SecretMissing)?;

        if (now.timestamp() - timestamp).abs() > SIGNATURE_FRESHNESS_SECS {
            return Err(SignatureError::StaleTimestamp);
        }

        let hex_sig = signature_header.strip_prefix("v0=").unwrap_or(signature_header);
        let expected = hex_decode(hex_sig).map_err(|_| SignatureError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Compute the signature for a payload. Useful for tests and for
    /// adapters that need to sign outbound mirrors of the contract.
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::SecretMissing)?;
        let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        Ok(format!("v0={}", hex_encode(&mac.finalize().into_bytes())))
    }
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> InboundSignatureValidator {
        InboundSignatureValidator::new(Some(SecretString::from("adapter-secret")))
    }

    #[test]
    fn fresh_signed_payload_verifies() {
        let v = validator();
        let now = Utc::now();
        let ts = now.timestamp();
        let body = br#"{"decision":"approve"}"#;

        let sig = v.sign(ts, body).unwrap();
        assert!(v.verify(ts, body, &sig, now).is_ok());
        // Bare hex without the v0= prefix also verifies.
        assert!(v.verify(ts, body, sig.strip_prefix("v0=").unwrap(), now).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected_even_with_valid_signature() {
        let v = validator();
        let now = Utc::now();
        let ts = now.timestamp() - SIGNATURE_FRESHNESS_SECS - 1;
        let body = b"payload";

        let sig = v.sign(ts, body).unwrap();
        assert_eq!(
            v.verify(ts, body, &sig, now),
            Err(SignatureError::StaleTimestamp)
        );
    }

    #[test]
    fn future_timestamp_beyond_window_is_rejected() {
        let v = validator();
        let now = Utc::now();
        let ts = now.timestamp() + SIGNATURE_FRESHNESS_SECS + 1;
        let sig = v.sign(ts, b"x").unwrap();
        assert_eq!(v.verify(ts, b"x", &sig, now), Err(SignatureError::StaleTimestamp));
    }

    #[test]
    fn boundary_timestamp_is_accepted() {
        let v = validator();
        let now = Utc::now();
        let ts = now.timestamp() - SIGNATURE_FRESHNESS_SECS;
        let sig = v.sign(ts, b"x").unwrap();
        assert!(v.verify(ts, b"x", &sig, now).is_ok());
    }

    #[test]
    fn wrong_body_fails() {
        let v = validator();
        let now = Utc::now();
        let ts = now.timestamp();
        let sig = v.sign(ts, b"original").unwrap();
        assert_eq!(
            v.verify(ts, b"tampered", &sig, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let v = validator();
        let other = InboundSignatureValidator::new(Some(SecretString::from("different")));
        let now = Utc::now();
        let ts = now.timestamp();
        let sig = other.sign(ts, b"payload").unwrap();
        assert_eq!(v.verify(ts, b"payload", &sig, now), Err(SignatureError::Mismatch));
    }

    #[test]
    fn missing_secret_fails_closed() {
        let v = InboundSignatureValidator::new(None);
        let now = Utc::now();
        assert_eq!(
            v.verify(now.timestamp(), b"payload", "v0=00", now),
            Err(SignatureError::SecretMissing)
        );
    }

    #[test]
    fn malformed_hex_is_rejected() {
        let v = validator();
        let now = Utc::now();
        let ts = now.timestamp();
        assert_eq!(
            v.verify(ts, b"x", "v0=zz", now),
            Err(SignatureError::Malformed)
        );
        assert_eq!(v.verify(ts, b"x", "v0=0", now), Err(SignatureError::Malformed));
    }

    // RFC 4231 test vector 2: known HMAC-SHA256 output for key "Jefe".
    #[test]
    fn hmac_sha256_rfc4231_vector() {
        let mut mac = HmacSha256::new_from_slice(b"Jefe").unwrap();
        mac.update(b"what do ya want for nothing?");
        let computed = hex_encode(&mac.finalize().into_bytes());
        assert_eq!(
            computed,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let data = b"Hello, World!";
        assert_eq!(hex_decode(&hex_encode(data)).unwrap(), data);
        assert!(hex_decode("0").is_err());
    }
}
