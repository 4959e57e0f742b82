//! Chatwoot webhook signature verification.
//!
//! Chatwoot signs `"{timestamp}.{body}"` with HMAC-SHA256 and sends the hex
//! digest in `X-Chatwoot-Signature` (optionally prefixed `sha256=`) next to
//! the unix timestamp in `X-Chatwoot-Timestamp`.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-chatwoot-signature";
pub const TIMESTAMP_HEADER: &str = "x-chatwoot-timestamp";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing X-Chatwoot-Signature header")]
    MissingSignature,
    #[error("missing X-Chatwoot-Timestamp header")]
    MissingTimestamp,
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("webhook is {age_secs}s old, tolerance is {tolerance_secs}s")]
    Expired { age_secs: i64, tolerance_secs: u64 },
    #[error("signature mismatch")]
    Mismatch,
}

#[derive(Clone, Debug)]
pub struct SignatureVerifier {
    secret: String,
    enforce: bool,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, enforce: bool, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            enforce,
            tolerance,
        }
    }

    /// Verification only happens when enforcement is on and a secret is set.
    pub fn is_active(&self) -> bool {
        self.enforce && !self.secret.is_empty()
    }

    pub fn verify(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<(), SignatureError> {
        self.verify_at(payload, signature, timestamp, chrono::Utc::now().timestamp())
    }

    /// Verify against an explicit clock reading (unix seconds).
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
        now: i64,
    ) -> Result<(), SignatureError> {
        if !self.is_active() {
            return Ok(());
        }
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::MissingSignature)?;
        let timestamp = timestamp
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::MissingTimestamp)?;
        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_string()))?;

        let age_secs = now.saturating_sub(sent_at);
        if age_secs > self.tolerance.as_secs() as i64 {
            return Err(SignatureError::Expired {
                age_secs,
                tolerance_secs: self.tolerance.as_secs(),
            });
        }

        let received = signature.strip_prefix("sha256=").unwrap_or(signature);
        let Ok(received) = hex::decode(received) else {
            return Err(SignatureError::Mismatch);
        };
        self.mac(timestamp, payload)?
            .verify_slice(&received)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Hex signature Chatwoot would send for `payload` at `timestamp`.
    #[cfg(test)]
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Option<String> {
        let mac = self.mac(&timestamp.to_string(), payload).ok()?;
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    fn mac(&self, timestamp: &str, payload: &[u8]) -> Result<Hmac<Sha256>, SignatureError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}
