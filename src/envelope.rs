// src/envelope.rs

//! Signed scan envelopes.
//!
//! Scan orders travel between the dispatcher and the scanner endpoints as a
//! JSON payload plus an HMAC-SHA256 signature over `"{timestamp}.{payload}"`.
//! The receiver recomputes the signature from its own serialization of the
//! payload and rejects anything stale or tampered with before touching the
//! network.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::core::scanner::ScanTask;

type HmacSha256 = Hmac<Sha256>;

/// Envelopes older than this are replayable and refused.
pub const MAX_ENVELOPE_AGE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("signature is not valid hex")]
    Encoding(#[from] hex::FromHexError),
    #[error("signing key rejected")]
    Key,
    #[error("signature mismatch")]
    Signature,
    #[error("envelope timestamp is {age_secs}s old, limit is {MAX_ENVELOPE_AGE_SECS}s")]
    Stale { age_secs: i64 },
}

/// What a scanner endpoint needs beyond the probe itself: routing keys for
/// the result and the optional requesting user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanPayload {
    #[serde(flatten)]
    pub task: ScanTask,
    pub domain_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub payload: ScanPayload,
    pub timestamp: i64,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn seal(payload: ScanPayload, key: &[u8]) -> Result<Self, EnvelopeError> {
        let timestamp = Utc::now().timestamp();
        let signature = hex::encode(sign(&payload, timestamp, key)?);
        Ok(Self {
            payload,
            timestamp,
            signature,
        })
    }

    /// Verifies age and signature, consuming the envelope on success.
    pub fn open(self, key: &[u8]) -> Result<ScanPayload, EnvelopeError> {
        let age_secs = (Utc::now().timestamp() - self.timestamp).abs();
        if age_secs > MAX_ENVELOPE_AGE_SECS {
            return Err(EnvelopeError::Stale { age_secs });
        }

        let mut mac = mac_for(key)?;
        mac.update(preimage(&self.payload, self.timestamp)?.as_bytes());
        mac.verify_slice(&hex::decode(&self.signature)?)
            .map_err(|_| EnvelopeError::Signature)?;
        Ok(self.payload)
    }
}

fn sign(payload: &ScanPayload, timestamp: i64, key: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut mac = mac_for(key)?;
    mac.update(preimage(payload, timestamp)?.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn preimage(payload: &ScanPayload, timestamp: i64) -> Result<String, EnvelopeError> {
    Ok(format!("{timestamp}.{}", serde_json::to_string(payload)?))
}

fn mac_for(key: &[u8]) -> Result<HmacSha256, EnvelopeError> {
    HmacSha256::new_from_slice(key).map_err(|_| EnvelopeError::Key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn payload() -> ScanPayload {
        ScanPayload {
            task: ScanTask {
                scan_id: Uuid::new_v4(),
                domain: "example.org".into(),
                selectors: vec!["selector1".into()],
                ip_address: None,
            },
            domain_key: "dom-1".into(),
            user_key: Some("user-1".into()),
            shared_id: Some("shared-1".into()),
        }
    }

    #[test]
    fn sealed_envelope_opens_with_same_key() {
        let original = payload();
        let sealed = SignedEnvelope::seal(original.clone(), b"secret").unwrap();
        let opened = sealed.open(b"secret").unwrap();
        assert_eq!(opened, original);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = SignedEnvelope::seal(payload(), b"secret").unwrap();
        assert!(matches!(
            sealed.open(b"other"),
            Err(EnvelopeError::Signature)
        ));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let mut sealed = SignedEnvelope::seal(payload(), b"secret").unwrap();
        sealed.payload.domain_key = "dom-2".into();
        assert!(matches!(
            sealed.open(b"secret"),
            Err(EnvelopeError::Signature)
        ));
    }

    #[test]
    fn stale_envelope_is_rejected() {
        let mut sealed = SignedEnvelope::seal(payload(), b"secret").unwrap();
        sealed.timestamp -= MAX_ENVELOPE_AGE_SECS + 1;
        assert!(matches!(
            sealed.open(b"secret"),
            Err(EnvelopeError::Stale { .. })
        ));
    }

    #[test]
    fn garbage_signature_is_an_encoding_error() {
        let mut sealed = SignedEnvelope::seal(payload(), b"secret").unwrap();
        sealed.signature = "not-hex".into();
        assert!(matches!(
            sealed.open(b"secret"),
            Err(EnvelopeError::Encoding(_))
        ));
    }
}
