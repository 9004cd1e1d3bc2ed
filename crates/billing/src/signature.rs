//! Webhook signature verification
//!
//! The provider signs each delivery with HMAC-SHA256 over `"{timestamp}.{body}"`
//! and sends `t=<timestamp>,v1=<hex>[,v1=<hex>...]` in the signature header.
//! Several `v1` entries appear while a secret is being rolled; any one match
//! is enough.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery, in seconds
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock reading (unix seconds)
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        // The timestamp is unauthenticated at this point and may be any i64
        let diff = now.abs_diff(timestamp);
        if diff > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(timestamp, now, diff, "Webhook timestamp outside tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = self.mac(payload, timestamp)?;

        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| bool::from(bytes.as_slice().ct_eq(expected.as_slice())))
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            tracing::warn!("Webhook signature mismatch");
            Err(BillingError::WebhookSignatureInvalid)
        }
    }

    /// Build a header value for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let mac = self.mac(payload, timestamp)?;
        Ok(format!("t={},v1={}", timestamp, hex::encode(mac)))
    }

    fn mac(&self, payload: &[u8], timestamp: i64) -> BillingResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_000_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new("whsec_test_secret")
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().sign(payload, NOW).unwrap();
        assert!(verifier().verify_at(payload, &header, NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = verifier().sign(br#"{"id":"evt_1"}"#, NOW).unwrap();
        let result = verifier().verify_at(br#"{"id":"evt_2"}"#, &header, NOW);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"{}";
        let header = SignatureVerifier::new("whsec_other").sign(payload, NOW).unwrap();
        assert!(verifier().verify_at(payload, &header, NOW).is_err());
    }

    #[test]
    fn test_expired_timestamp_rejected() {
        let payload = b"{}";
        let header = verifier().sign(payload, NOW).unwrap();
        assert!(verifier().verify_at(payload, &header, NOW + 301).is_err());
        assert!(verifier().verify_at(payload, &header, NOW + 300).is_ok());
    }

    #[test]
    fn test_extreme_clock_readings_rejected_without_overflow() {
        let payload = b"{}";
        let header = verifier().sign(payload, NOW).unwrap();
        assert!(verifier().verify_at(payload, &header, i64::MIN).is_err());
        assert!(verifier().verify_at(payload, &header, i64::MAX).is_err());

        let header = verifier().sign(payload, i64::MIN).unwrap();
        assert!(verifier().verify_at(payload, &header, i64::MAX).is_err());
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let payload = b"{}";
        let good = verifier().sign(payload, NOW).unwrap();
        let good_sig = good.split_once(",v1=").unwrap().1;
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), good_sig);
        assert!(verifier().verify_at(payload, &header, NOW).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let payload = b"{}";
        for header in [
            "",
            "t=abc,v1=00",
            "v1=00",
            "t=1760000000",
            "garbage",
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert!(
                verifier().verify_at(payload, header, NOW).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }
}
