//! Regional payment-aggregator webhook adapter.
//!
//! The aggregator signs its webhooks with a plain HMAC-SHA256 over the raw
//! request body, hex encoded in an `X-Signature` header. There is no
//! timestamp in the scheme, so replay protection comes entirely from the
//! reconciliation engine's idempotent short-circuit.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::Result;
use crate::catalog::Catalog;
use crate::sessions::PaymentProvider;

use super::error::PaymentError;
use super::{PaymentIntent, TerminalStatus};

type HmacSha256 = Hmac<Sha256>;

/// Aggregator webhook verifier and intent mapper.
pub struct AggregatorWebhook {
    webhook_secret: SecretString,
    catalog: Catalog,
}

impl AggregatorWebhook {
    #[must_use]
    pub fn new(webhook_secret: impl Into<SecretString>, catalog: Catalog) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            catalog,
        }
    }

    /// Verify the body HMAC and parse the event envelope.
    ///
    /// # Errors
    /// `VerificationFailed` on a bad or undecodable signature,
    /// `MalformedPayload` when the verified body is not a valid envelope.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<AggregatorEvent> {
        let provided = hex::decode(signature.trim())
            .map_err(|_| PaymentError::VerificationFailed { provider: "aggregator" })?;

        let mut mac =
            HmacSha256::new_from_slice(self.webhook_secret.expose_secret().as_bytes())
                .expect("HMAC can take key of any size");
        mac.update(payload);
        let expected = mac.finalize().into_bytes().to_vec();

        if expected.ct_eq(&provided).unwrap_u8() != 1 {
            tracing::warn!(
                target: "tollgate::payments::aggregator",
                "Aggregator webhook signature verification failed"
            );
            return Err(PaymentError::VerificationFailed { provider: "aggregator" }.into());
        }

        let event: AggregatorEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "tollgate::payments::aggregator",
                error = %e,
                "Failed to parse aggregator webhook payload"
            );
            PaymentError::MalformedPayload {
                message: "malformed JSON payload".to_string(),
            }
        })?;

        Ok(event)
    }

    /// Map a verified event to a normalized intent.
    ///
    /// Returns `None` for event types this engine does not act on. The
    /// aggregator carries a product id instead of an amount breakdown, so
    /// the catalog resolves it; an unknown product is rejected rather than
    /// trusting the payload's own numbers.
    pub fn intent(&self, event: &AggregatorEvent) -> Result<Option<PaymentIntent>> {
        let terminal = match event.event.as_str() {
            "order.completed" => TerminalStatus::Succeeded,
            "order.failed" | "order.cancelled" => TerminalStatus::Failed,
            _ => return Ok(None),
        };

        let package = self
            .catalog
            .find_by_provider_product(&event.order.product_id)
            .ok_or_else(|| PaymentError::UnknownPackage {
                package: event.order.product_id.clone(),
            })?;

        Ok(Some(PaymentIntent {
            provider: PaymentProvider::Aggregator,
            provider_ref: event.order.order_id.clone(),
            session_id: event.order.merchant_reference.clone(),
            user_id: event.order.customer_id.clone(),
            amount_minor: Some(package.price_minor),
            currency: Some(package.currency.clone()),
            terminal,
        }))
    }
}

/// Aggregator webhook envelope.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AggregatorEvent {
    /// Event type (e.g., "order.completed").
    pub event: String,
    /// The order the event describes.
    pub order: AggregatorOrder,
}

/// Order payload inside an aggregator event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AggregatorOrder {
    /// Aggregator-side order id; used as the grant's external reference.
    pub order_id: String,
    /// Product/variant the customer bought.
    pub product_id: String,
    /// Our session id, echoed back from checkout creation.
    pub merchant_reference: Option<String>,
    /// Aggregator-side customer id, when known.
    pub customer_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "agg_webhook_secret";

    fn test_catalog() -> Catalog {
        Catalog::builder()
            .package("starter")
                .name("Starter")
                .credits(5)
                .price_minor(499, "usd")
                .provider_product("variant_starter")
                .done()
            .build()
    }

    fn sign(payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    fn completed_payload() -> String {
        serde_json::json!({
            "event": "order.completed",
            "order": {
                "order_id": "ord_77",
                "product_id": "variant_starter",
                "merchant_reference": "local_sess_9",
                "customer_id": "u1"
            }
        })
        .to_string()
    }

    #[test]
    fn test_verify_valid_signature() {
        let adapter = AggregatorWebhook::new(SECRET, test_catalog());
        let payload = completed_payload();
        let event = adapter.verify(payload.as_bytes(), &sign(payload.as_bytes())).unwrap();
        assert_eq!(event.event, "order.completed");
        assert_eq!(event.order.order_id, "ord_77");
    }

    #[test]
    fn test_verify_wrong_secret() {
        let adapter = AggregatorWebhook::new("other_secret", test_catalog());
        let payload = completed_payload();
        assert!(adapter
            .verify(payload.as_bytes(), &sign(payload.as_bytes()))
            .is_err());
    }

    #[test]
    fn test_verify_garbage_signature() {
        let adapter = AggregatorWebhook::new(SECRET, test_catalog());
        let payload = completed_payload();
        assert!(adapter.verify(payload.as_bytes(), "not-hex").is_err());
        assert!(adapter.verify(payload.as_bytes(), "").is_err());
    }

    #[test]
    fn test_verify_tampered_payload() {
        let adapter = AggregatorWebhook::new(SECRET, test_catalog());
        let payload = completed_payload();
        let signature = sign(payload.as_bytes());
        let tampered = payload.replace("variant_starter", "variant_pro");
        assert!(adapter.verify(tampered.as_bytes(), &signature).is_err());
    }

    #[test]
    fn test_intent_resolves_package_credits() {
        let adapter = AggregatorWebhook::new(SECRET, test_catalog());
        let event: AggregatorEvent = serde_json::from_str(&completed_payload()).unwrap();

        let intent = adapter.intent(&event).unwrap().unwrap();
        assert_eq!(intent.provider, PaymentProvider::Aggregator);
        assert_eq!(intent.provider_ref, "ord_77");
        assert_eq!(intent.session_id.as_deref(), Some("local_sess_9"));
        assert_eq!(intent.amount_minor, Some(499));
        assert_eq!(intent.terminal, TerminalStatus::Succeeded);
    }

    #[test]
    fn test_intent_failed_event() {
        let adapter = AggregatorWebhook::new(SECRET, test_catalog());
        let payload = completed_payload().replace("order.completed", "order.failed");
        let event: AggregatorEvent = serde_json::from_str(&payload).unwrap();

        let intent = adapter.intent(&event).unwrap().unwrap();
        assert_eq!(intent.terminal, TerminalStatus::Failed);
    }

    #[test]
    fn test_intent_unknown_product_rejected() {
        let adapter = AggregatorWebhook::new(SECRET, test_catalog());
        let payload = completed_payload().replace("variant_starter", "variant_unknown");
        let event: AggregatorEvent = serde_json::from_str(&payload).unwrap();

        assert!(adapter.intent(&event).is_err());
    }

    #[test]
    fn test_intent_ignores_unrelated_events() {
        let adapter = AggregatorWebhook::new(SECRET, test_catalog());
        let payload = completed_payload().replace("order.completed", "customer.updated");
        let event: AggregatorEvent = serde_json::from_str(&payload).unwrap();

        assert!(adapter.intent(&event).unwrap().is_none());
    }
}
