//! Provider adapters for the three payment rails.
//!
//! Each provider has its own trust model (signed webhook, HMAC webhook,
//! RSA-credential polling) and its own failure modes, but every adapter
//! normalizes what it observed into a [`PaymentIntent`]. The reconciliation
//! engine only ever consumes intents; no provider-specific branching exists
//! past this module boundary.

pub mod aggregator;
pub mod card;
pub mod error;
pub mod mobile_money;

pub use aggregator::AggregatorWebhook;
pub use card::CardWebhook;
pub use error::PaymentError;
pub use mobile_money::{
    ChargeState, InitiatedPayment, LiveMobileMoneyClient, MobileMoneyAdapter, MobileMoneyClient,
    MobileMoneyConfig, PollOutcome, mask_phone,
};

use crate::sessions::PaymentProvider;
use serde::{Deserialize, Serialize};

/// Terminal state a provider reported for a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Funds cleared; credits should be granted.
    Succeeded,
    /// Payment failed or was abandoned; no grant.
    Failed,
}

/// A verified provider event, normalized for the reconciliation engine.
///
/// `provider_ref` doubles as the grant's external reference, so it must be
/// stable across webhook retries and polls for the same payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub provider: PaymentProvider,
    /// Provider-side payment reference (checkout session / order /
    /// conversation id).
    pub provider_ref: String,
    /// Local session id when the provider echoes our metadata back.
    pub session_id: Option<String>,
    /// User id from provider metadata, when present. Informational; the
    /// session row is authoritative.
    pub user_id: Option<String>,
    /// Amount the provider says was paid, minor units. Informational.
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub terminal: TerminalStatus,
}
