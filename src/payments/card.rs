//! Card-processor webhook adapter.
//!
//! The card processor pushes signed webhooks: a `t=<unix>,v1=<hex>` header
//! whose signature is HMAC-SHA256 over `"{timestamp}.{raw body}"`. The
//! timestamp bounds replay; the comparison is constant-time. Verification
//! happens before the payload is even parsed, and nothing here touches the
//! ledger.
//!
//! The webhook secret is held in [`SecretString`] so it cannot leak through
//! debug output.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::Result;
use crate::sessions::PaymentProvider;
use crate::utils::unix_now;

use super::error::PaymentError;
use super::{PaymentIntent, TerminalStatus};

/// Maximum accepted webhook age in seconds.
const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// Card-processor webhook verifier and intent mapper.
pub struct CardWebhook {
    webhook_secret: SecretString,
    tolerance_seconds: i64,
}

impl CardWebhook {
    /// Create a new adapter with the standard 5-minute replay tolerance.
    #[must_use]
    pub fn new(webhook_secret: impl Into<SecretString>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
        }
    }

    /// Override the replay tolerance (tests, clock-skewed environments).
    #[must_use]
    pub fn with_tolerance(mut self, seconds: i64) -> Self {
        self.tolerance_seconds = seconds;
        self
    }

    /// Verify the webhook signature and parse the event.
    ///
    /// # Errors
    /// `StaleTimestamp` when the header timestamp is outside the tolerance,
    /// `VerificationFailed` on a bad signature, `MalformedPayload` when the
    /// verified body is not a well-formed event.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<CardEvent> {
        let sig_parts = parse_signature_header(signature_header)?;

        let age = (unix_now() as i64 - sig_parts.timestamp).abs();
        if age > self.tolerance_seconds {
            return Err(PaymentError::StaleTimestamp { age_seconds: age }.into());
        }

        let signed_payload = format!(
            "{}.{}",
            sig_parts.timestamp,
            String::from_utf8_lossy(payload)
        );
        let expected = compute_signature(
            self.webhook_secret.expose_secret(),
            signed_payload.as_bytes(),
        );

        let provided = hex::decode(&sig_parts.signature)
            .map_err(|_| PaymentError::VerificationFailed { provider: "card" })?;

        if expected.ct_eq(&provided).unwrap_u8() != 1 {
            tracing::warn!(
                target: "tollgate::payments::card",
                "Card webhook signature verification failed"
            );
            return Err(PaymentError::VerificationFailed { provider: "card" }.into());
        }

        let event: CardEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "tollgate::payments::card",
                error = %e,
                "Failed to parse card webhook payload"
            );
            PaymentError::MalformedPayload {
                message: "malformed JSON payload".to_string(),
            }
        })?;

        Ok(event)
    }

    /// Map a verified event to a normalized intent.
    ///
    /// Returns `None` for event types this engine does not act on.
    pub fn intent(&self, event: &CardEvent) -> Result<Option<PaymentIntent>> {
        let terminal = match event.event_type.as_str() {
            "checkout.session.completed" => TerminalStatus::Succeeded,
            "checkout.session.expired" | "checkout.session.async_payment_failed" => {
                TerminalStatus::Failed
            }
            _ => return Ok(None),
        };

        let object = event
            .data
            .object
            .as_object()
            .ok_or_else(|| PaymentError::MalformedPayload {
                message: "event data is not an object".to_string(),
            })?;

        let provider_ref = object
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentError::MalformedPayload {
                message: "missing checkout session id".to_string(),
            })?
            .to_string();

        let metadata = object.get("metadata").and_then(|v| v.as_object());
        let meta_str = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(|v| v.as_str())
                .map(String::from)
        };

        Ok(Some(PaymentIntent {
            provider: PaymentProvider::Card,
            provider_ref,
            session_id: meta_str("session_id"),
            user_id: meta_str("user_id"),
            amount_minor: object.get("amount_total").and_then(|v| v.as_i64()),
            currency: object
                .get("currency")
                .and_then(|v| v.as_str())
                .map(String::from),
            terminal,
        }))
    }
}

/// Parsed card webhook event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CardEvent {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: CardEventData,
    /// Timestamp when the event was created.
    pub created: u64,
}

/// Card webhook event data.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CardEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

/// Parse the `t=<unix>,v1=<hex>` signature header.
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(PaymentError::MalformedPayload {
                message: "invalid signature header format".to_string(),
            }
            .into());
        };

        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            _ => {} // Ignore other schemes
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp.ok_or(PaymentError::MalformedPayload {
            message: "missing timestamp in signature header".to_string(),
        })?,
        signature: signature.ok_or(PaymentError::MalformedPayload {
            message: "missing v1 signature".to_string(),
        })?,
    })
}

/// Compute HMAC-SHA256 over the signed payload.
fn compute_signature(secret: &str, payload: &[u8]) -> Vec<u8> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let sig = hex::encode(compute_signature(SECRET, signed_payload.as_bytes()));
        format!("t={},v1={}", timestamp, sig)
    }

    fn completed_payload() -> String {
        serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000u64,
            "data": {
                "object": {
                    "id": "cs_abc",
                    "amount_total": 499,
                    "currency": "usd",
                    "metadata": {
                        "session_id": "local_sess_1",
                        "user_id": "u1"
                    }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_signature_header() {
        let parts = parse_signature_header("t=1234567890,v1=abc123").unwrap();
        assert_eq!(parts.timestamp, 1234567890);
        assert_eq!(parts.signature, "abc123");
    }

    #[test]
    fn test_parse_signature_header_invalid() {
        assert!(parse_signature_header("garbage").is_err());
        assert!(parse_signature_header("v1=deadbeef").is_err());
        assert!(parse_signature_header("t=42").is_err());
    }

    #[test]
    fn test_verify_valid_signature() {
        let adapter = CardWebhook::new(SECRET);
        let payload = completed_payload();
        let header = sign(payload.as_bytes(), unix_now() as i64);

        let event = adapter.verify(payload.as_bytes(), &header).unwrap();
        assert_eq!(event.event_type, "checkout.session.completed");
    }

    #[test]
    fn test_verify_wrong_signature() {
        let adapter = CardWebhook::new(SECRET);
        let payload = completed_payload();
        let header = format!("t={},v1={}", unix_now(), "00".repeat(32));

        assert!(adapter.verify(payload.as_bytes(), &header).is_err());
    }

    #[test]
    fn test_verify_tampered_payload() {
        let adapter = CardWebhook::new(SECRET);
        let payload = completed_payload();
        let header = sign(payload.as_bytes(), unix_now() as i64);

        let tampered = payload.replace("\"amount_total\":499", "\"amount_total\":1");
        assert!(adapter.verify(tampered.as_bytes(), &header).is_err());
    }

    #[test]
    fn test_verify_stale_timestamp() {
        let adapter = CardWebhook::new(SECRET);
        let payload = completed_payload();
        // Signed a long time ago; signature itself is valid.
        let header = sign(payload.as_bytes(), 1_000_000_000);

        assert!(adapter.verify(payload.as_bytes(), &header).is_err());
    }

    #[test]
    fn test_intent_success_event() {
        let adapter = CardWebhook::new(SECRET);
        let event: CardEvent = serde_json::from_str(&completed_payload()).unwrap();

        let intent = adapter.intent(&event).unwrap().unwrap();
        assert_eq!(intent.provider, PaymentProvider::Card);
        assert_eq!(intent.provider_ref, "cs_abc");
        assert_eq!(intent.session_id.as_deref(), Some("local_sess_1"));
        assert_eq!(intent.user_id.as_deref(), Some("u1"));
        assert_eq!(intent.amount_minor, Some(499));
        assert_eq!(intent.terminal, TerminalStatus::Succeeded);
    }

    #[test]
    fn test_intent_failure_event() {
        let adapter = CardWebhook::new(SECRET);
        let payload = completed_payload().replace(
            "checkout.session.completed",
            "checkout.session.expired",
        );
        let event: CardEvent = serde_json::from_str(&payload).unwrap();

        let intent = adapter.intent(&event).unwrap().unwrap();
        assert_eq!(intent.terminal, TerminalStatus::Failed);
    }

    #[test]
    fn test_intent_ignores_unrelated_events() {
        let adapter = CardWebhook::new(SECRET);
        let payload = completed_payload().replace(
            "checkout.session.completed",
            "customer.updated",
        );
        let event: CardEvent = serde_json::from_str(&payload).unwrap();

        assert!(adapter.intent(&event).unwrap().is_none());
    }

    #[test]
    fn test_intent_missing_ref_rejected() {
        let adapter = CardWebhook::new(SECRET);
        let event = CardEvent {
            id: "evt_1".to_string(),
            event_type: "checkout.session.completed".to_string(),
            created: 0,
            data: CardEventData {
                object: serde_json::json!({ "metadata": {} }),
            },
        };

        assert!(adapter.intent(&event).is_err());
    }
}
