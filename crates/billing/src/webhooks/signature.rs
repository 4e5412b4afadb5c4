//! Stripe webhook signature verification
//!
//! The `Stripe-Signature` header looks like `t=1700000000,v1=<hex>,v0=<hex>`.
//! The signed payload is `"{t}." + raw body` and each `v1` entry is the
//! hex-encoded HMAC-SHA256 of it under the endpoint secret. Verification must
//! run on the raw request bytes, never on a re-serialized parse.
//!
//! Every failure is reported to callers as the same
//! [`BillingError::WebhookSignatureInvalid`]; the specific reason is only
//! logged at debug level.

use std::time::Duration;

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::event::ProviderEvent;

type HmacSha256 = Hmac<Sha256>;

/// Default age limit for a signed delivery (5 minutes)
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// An event whose signature checked out, with the document it was decoded from
#[derive(Debug, Clone)]
pub struct VerifiedEvent {
    pub event: ProviderEvent,
    pub document: serde_json::Value,
}

/// Why a delivery was rejected. Internal only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    MissingHeader,
    MalformedHeader,
    StaleTimestamp,
    Mismatch,
    MalformedPayload,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify a delivery against the current clock.
    pub fn verify(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> BillingResult<VerifiedEvent> {
        self.verify_at(raw_body, signature_header, OffsetDateTime::now_utc())
    }

    /// Verify a delivery as of `now`.
    pub fn verify_at(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<VerifiedEvent> {
        self.check(raw_body, signature_header, now).map_err(|reason| {
            tracing::debug!(reason = ?reason, body_len = raw_body.len(), "Webhook rejected");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Produce a header value for `raw_body` signed at `timestamp`. Used to
    /// build fixtures and by local replay tooling.
    pub fn sign(&self, raw_body: &[u8], timestamp: i64) -> BillingResult<String> {
        let mac = self
            .mac_for(raw_body, timestamp)
            .map_err(|e| BillingError::Config(format!("webhook signing key rejected: {}", e)))?;
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn check(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<VerifiedEvent, Rejection> {
        let header = signature_header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(Rejection::MissingHeader)?;

        let (timestamp, candidates) = parse_header(header)?;

        let age = now.unix_timestamp().abs_diff(timestamp);
        if age > self.tolerance.as_secs() {
            return Err(Rejection::StaleTimestamp);
        }

        let mac = self
            .mac_for(raw_body, timestamp)
            .map_err(|_| Rejection::Mismatch)?;
        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if !matched {
            return Err(Rejection::Mismatch);
        }

        let document: serde_json::Value =
            serde_json::from_slice(raw_body).map_err(|_| Rejection::MalformedPayload)?;
        let event =
            ProviderEvent::from_document(&document).map_err(|_| Rejection::MalformedPayload)?;

        Ok(VerifiedEvent { event, document })
    }

    fn mac_for(&self, raw_body: &[u8], timestamp: i64) -> Result<HmacSha256, InvalidLength> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(raw_body);
        Ok(mac)
    }
}

/// Split `t=...,v1=...` into the timestamp and every `v1` candidate.
fn parse_header(header: &str) -> Result<(i64, Vec<&str>), Rejection> {
    let mut timestamp: Option<i64> = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" if !value.is_empty() => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(Rejection::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(Rejection::MalformedHeader);
    }
    Ok((timestamp, candidates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::event::EventKind;

    const SECRET: &str = "whsec_test_secret";

    fn body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "pi_1", "amount": 5000, "currency": "usd", "status": "succeeded"
            }}
        }))
        .unwrap()
    }

    fn at(ts: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(ts).unwrap()
    }

    #[test]
    fn test_valid_signature_decodes_event() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = body();
        let header = verifier.sign(&raw, 1_700_000_000).unwrap();

        let verified = verifier
            .verify_at(&raw, Some(&header), at(1_700_000_010))
            .unwrap();
        assert_eq!(verified.event.id, "evt_1");
        assert_eq!(verified.event.kind(), Some(EventKind::PaymentIntentSucceeded));
        assert_eq!(verified.document["data"]["object"]["id"], "pi_1");
    }

    #[test]
    fn test_any_v1_candidate_may_match() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = body();
        let good = verifier.sign(&raw, 1_700_000_000).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t=1700000000,v1={},v1={},v0=abc", "00".repeat(32), good_sig);

        assert!(verifier
            .verify_at(&raw, Some(&header), at(1_700_000_000))
            .is_ok());
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = body();
        let header = verifier.sign(&raw, 1_700_000_000).unwrap();
        let mut tampered = raw.clone();
        let pos = tampered.iter().position(|b| *b == b'5').unwrap();
        tampered[pos] = b'9';

        let err = verifier
            .verify_at(&tampered, Some(&header), at(1_700_000_000))
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let signer = SignatureVerifier::new("whsec_other", DEFAULT_TOLERANCE);
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = body();
        let header = signer.sign(&raw, 1_700_000_000).unwrap();

        assert!(verifier
            .verify_at(&raw, Some(&header), at(1_700_000_000))
            .is_err());
    }

    #[test]
    fn test_timestamp_tolerance_boundary() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = body();
        let header = verifier.sign(&raw, 1_700_000_000).unwrap();

        // 300s old is accepted, 301s is not
        assert!(verifier
            .verify_at(&raw, Some(&header), at(1_700_000_300))
            .is_ok());
        assert!(verifier
            .verify_at(&raw, Some(&header), at(1_700_000_301))
            .is_err());
    }

    #[test]
    fn test_missing_and_malformed_headers_fail_uniformly() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = body();
        let now = at(1_700_000_000);

        for header in [None, Some(""), Some("garbage"), Some("t=abc,v1=00"), Some("t=1700000000")] {
            let err = verifier.verify_at(&raw, header, now).unwrap_err();
            assert!(
                matches!(err, BillingError::WebhookSignatureInvalid),
                "header {:?} should be rejected as invalid signature",
                header
            );
        }
    }

    #[test]
    fn test_extreme_timestamps_are_stale_not_a_panic() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = body();
        let now = at(1_700_000_000);

        for ts in [i64::MIN, i64::MAX, i64::MIN + 1, -1] {
            let header = format!("t={},v1={}", ts, "00".repeat(32));
            let err = verifier.verify_at(&raw, Some(&header), now).unwrap_err();
            assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        }
    }

    #[test]
    fn test_signed_but_malformed_payload_is_rejected() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        let raw = br#"{"id":"evt_1","type":"account.updated"}"#.to_vec();
        let header = verifier.sign(&raw, 1_700_000_000).unwrap();

        let err = verifier
            .verify_at(&raw, Some(&header), at(1_700_000_000))
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_debug_output_redacts_secret() {
        let verifier = SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE);
        assert!(!format!("{:?}", verifier).contains(SECRET));
    }
}
