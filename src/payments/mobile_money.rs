//! Mobile-money gateway adapter.
//!
//! This rail has no reliable push channel: the engine initiates a charge
//! against the customer's phone and then polls until a terminal state is
//! observed. Authentication works by RSA-encrypting an API credential with
//! the provider's public key and exchanging it for a short-lived bearer
//! token on every call.
//!
//! Polling rules, which the rest of the crate depends on:
//! - "not yet settled" is a normal outcome, not an error;
//! - a timed-out poll is reported as still pending, never as failure, so a
//!   later poll can still reconcile the real outcome;
//! - nothing here mutates state; terminal observations are handed to the
//!   reconciliation engine as a [`PaymentIntent`].

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey, pkcs8::DecodePublicKey};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::error::{Result, TollgateError};
use crate::sessions::{PaymentProvider, PaymentSession, SessionStatus, SessionStore};
use crate::utils::get_env_with_prefix;

use super::error::PaymentError;
use super::{PaymentIntent, TerminalStatus};

/// Configuration for the live mobile-money client.
#[derive(Clone)]
pub struct MobileMoneyConfig {
    /// Gateway API base URL.
    pub base_url: String,
    /// API credential, RSA-encrypted before it ever leaves the process.
    pub api_key: SecretString,
    /// Provider RSA public key, PEM encoded.
    pub public_key_pem: String,
    /// Merchant shortcode charges are billed against.
    pub shortcode: String,
    /// Per-request timeout in seconds.
    pub timeout_seconds: u64,
}

impl MobileMoneyConfig {
    /// Load from `MOBILE_MONEY_*` environment variables.
    ///
    /// Returns `None` when the required variables are absent (the rail is
    /// simply not configured in that deployment).
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = get_env_with_prefix("MOBILE_MONEY_BASE_URL")?;
        let api_key = get_env_with_prefix("MOBILE_MONEY_API_KEY")?;
        let public_key_pem = get_env_with_prefix("MOBILE_MONEY_PUBLIC_KEY")?;
        let shortcode = get_env_with_prefix("MOBILE_MONEY_SHORTCODE")?;
        let timeout_seconds = get_env_with_prefix("MOBILE_MONEY_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Some(Self {
            base_url,
            api_key: api_key.into(),
            public_key_pem,
            shortcode,
            timeout_seconds,
        })
    }
}

impl std::fmt::Debug for MobileMoneyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MobileMoneyConfig")
            .field("base_url", &self.base_url)
            .field("shortcode", &self.shortcode)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish_non_exhaustive()
    }
}

/// Result of submitting a charge to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeInitiation {
    /// Gateway conversation id; used as the session's provider reference.
    pub conversation_id: String,
}

/// Charge state as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    /// Customer has not confirmed (or funds have not cleared) yet.
    Pending,
    Succeeded,
    Failed,
}

/// Trait for gateway API operations.
#[async_trait]
pub trait MobileMoneyClient: Send + Sync {
    /// Submit a charge request against a customer phone number.
    async fn initiate_charge(
        &self,
        phone: &str,
        amount_minor: i64,
        currency: &str,
        reference: &str,
    ) -> Result<ChargeInitiation>;

    /// Query the current state of a charge by conversation id.
    async fn charge_status(&self, conversation_id: &str) -> Result<ChargeState>;
}

/// Live gateway client over HTTP.
pub struct LiveMobileMoneyClient {
    http: reqwest::Client,
    config: MobileMoneyConfig,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct InitiateResponse {
    conversation_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

impl LiveMobileMoneyClient {
    /// Create a client; the HTTP timeout comes from the config so no
    /// gateway call can block a handler indefinitely.
    pub fn new(config: MobileMoneyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(|e| TollgateError::Internal(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { http, config })
    }

    /// RSA-encrypt the API credential with the provider's public key.
    fn encrypt_credential(&self) -> Result<String> {
        let public_key = RsaPublicKey::from_public_key_pem(&self.config.public_key_pem)
            .map_err(|e| TollgateError::Internal(format!("Invalid gateway public key: {}", e)))?;

        let mut rng = rand::thread_rng();
        let encrypted = public_key
            .encrypt(
                &mut rng,
                Pkcs1v15Encrypt,
                self.config.api_key.expose_secret().as_bytes(),
            )
            .map_err(|e| TollgateError::Internal(format!("Credential encryption failed: {}", e)))?;

        Ok(BASE64.encode(encrypted))
    }

    /// Exchange the encrypted credential for a short-lived bearer token.
    async fn bearer_token(&self) -> Result<String> {
        let credential = self.encrypt_credential()?;
        let response = self
            .http
            .post(format!("{}/auth/token", self.config.base_url))
            .json(&serde_json::json!({ "credential": credential }))
            .send()
            .await?
            .error_for_status()?;

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl MobileMoneyClient for LiveMobileMoneyClient {
    async fn initiate_charge(
        &self,
        phone: &str,
        amount_minor: i64,
        currency: &str,
        reference: &str,
    ) -> Result<ChargeInitiation> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .post(format!("{}/charges", self.config.base_url))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "shortcode": self.config.shortcode,
                "phone": phone,
                "amount": amount_minor,
                "currency": currency,
                "reference": reference,
            }))
            .send()
            .await?
            .error_for_status()?;

        let initiated: InitiateResponse = response.json().await?;
        Ok(ChargeInitiation {
            conversation_id: initiated.conversation_id,
        })
    }

    async fn charge_status(&self, conversation_id: &str) -> Result<ChargeState> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!(
                "{}/charges/{}",
                self.config.base_url, conversation_id
            ))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;

        let status: StatusResponse = response.json().await?;
        match status.status.as_str() {
            "pending" | "processing" => Ok(ChargeState::Pending),
            "succeeded" | "completed" => Ok(ChargeState::Succeeded),
            "failed" | "cancelled" | "timeout" => Ok(ChargeState::Failed),
            other => Err(PaymentError::Provider {
                operation: "charge_status".to_string(),
                message: format!("unknown charge status '{}'", other),
                http_status: None,
            }
            .into()),
        }
    }
}

/// Response to a charge initiation, safe to surface to a client.
#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct InitiatedPayment {
    /// Local payment id; poll with this.
    pub payment_id: String,
    /// The charged phone number, partially masked.
    pub phone: String,
    /// Always true for this rail: there is no webhook coming.
    pub requires_polling: bool,
}

/// Outcome of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not settled yet (includes gateway timeouts). Poll again later.
    StillPending,
    /// The session already reached a terminal state; nothing to do.
    AlreadySettled(SessionStatus),
    /// A terminal provider state was observed; feed this to the
    /// reconciliation engine.
    Resolved(PaymentIntent),
}

/// Mobile-money orchestration over a [`SessionStore`] and a gateway client.
pub struct MobileMoneyAdapter<S: SessionStore, C: MobileMoneyClient> {
    sessions: Arc<S>,
    client: C,
    catalog: Catalog,
}

impl<S: SessionStore, C: MobileMoneyClient> MobileMoneyAdapter<S, C> {
    #[must_use]
    pub fn new(sessions: Arc<S>, client: C, catalog: Catalog) -> Self {
        Self {
            sessions,
            client,
            catalog,
        }
    }

    /// Initiate a charge: persist a PENDING session first, then submit the
    /// charge, then record the gateway conversation id on the session.
    ///
    /// Ordering matters: if the process dies after the gateway accepted the
    /// charge but before we stored the conversation id, the PENDING row
    /// still exists and the expiry sweep (or an operator, via the gateway's
    /// own records) can resolve it.
    pub async fn initiate(
        &self,
        user_id: &str,
        package_id: &str,
        phone: &str,
    ) -> Result<InitiatedPayment> {
        let package = self
            .catalog
            .get(package_id)
            .ok_or_else(|| PaymentError::UnknownPackage {
                package: package_id.to_string(),
            })?;

        let session = PaymentSession::new(user_id, PaymentProvider::MobileMoney, package);
        self.sessions.create(&session).await?;

        let initiated = self
            .client
            .initiate_charge(phone, package.price_minor, &package.currency, &session.id)
            .await?;

        self.sessions
            .set_provider_ref(&session.id, &initiated.conversation_id)
            .await?;

        tracing::info!(
            target: "tollgate::payments::mobile_money",
            session_id = %session.id,
            conversation_id = %initiated.conversation_id,
            "Initiated mobile-money charge"
        );

        Ok(InitiatedPayment {
            payment_id: session.id,
            phone: mask_phone(phone),
            requires_polling: true,
        })
    }

    /// Poll a payment by its local id. Idempotent and safe to call from
    /// both a user action and the scheduled sweep, concurrently.
    pub async fn poll(&self, payment_id: &str) -> Result<PollOutcome> {
        let session = self
            .sessions
            .get(payment_id)
            .await?
            .ok_or_else(|| PaymentError::UnknownSession {
                session_id: payment_id.to_string(),
            })?;

        if session.status.is_terminal() {
            return Ok(PollOutcome::AlreadySettled(session.status));
        }

        // Initiation crashed before the conversation id was stored; there
        // is nothing to ask the gateway about. The expiry sweep owns it.
        let Some(provider_ref) = session.provider_ref.clone() else {
            return Ok(PollOutcome::StillPending);
        };

        let state = match self.client.charge_status(&provider_ref).await {
            Ok(state) => state,
            Err(TollgateError::RequestTimeout) | Err(TollgateError::ServiceUnavailable(_)) => {
                tracing::warn!(
                    target: "tollgate::payments::mobile_money",
                    session_id = %payment_id,
                    "Charge status poll timed out; treating as still pending"
                );
                return Ok(PollOutcome::StillPending);
            }
            Err(err) => return Err(err),
        };

        let terminal = match state {
            ChargeState::Pending => return Ok(PollOutcome::StillPending),
            ChargeState::Succeeded => TerminalStatus::Succeeded,
            ChargeState::Failed => TerminalStatus::Failed,
        };

        Ok(PollOutcome::Resolved(PaymentIntent {
            provider: PaymentProvider::MobileMoney,
            provider_ref,
            session_id: Some(session.id),
            user_id: Some(session.user_id),
            amount_minor: Some(session.amount_minor),
            currency: Some(session.currency),
            terminal,
        }))
    }

    /// Poll every PENDING mobile-money session. Used by the scheduled
    /// sweep; failures on one session don't stop the others.
    pub async fn poll_all_pending(&self) -> Result<Vec<(String, PollOutcome)>> {
        let pending = self
            .sessions
            .pending_for_provider(PaymentProvider::MobileMoney)
            .await?;

        let polls = pending.iter().map(|session| async {
            let outcome = self.poll(&session.id).await;
            (session.id.clone(), outcome)
        });

        let results = futures::future::join_all(polls).await;
        Ok(results
            .into_iter()
            .filter_map(|(id, outcome)| match outcome {
                Ok(outcome) => Some((id, outcome)),
                Err(err) => {
                    tracing::warn!(
                        target: "tollgate::payments::mobile_money",
                        session_id = %id,
                        error = %err,
                        "Scheduled poll failed"
                    );
                    None
                }
            })
            .collect())
    }
}

/// Mask a phone number for client-facing responses.
///
/// Keeps the dialing prefix and the last two digits: enough for the user to
/// recognize their own number, useless to anyone else.
#[must_use]
pub fn mask_phone(phone: &str) -> String {
    let len = phone.chars().count();
    if len <= 6 {
        return "*".repeat(len);
    }
    phone
        .chars()
        .enumerate()
        .map(|(i, c)| if i < 4 || i >= len - 2 { c } else { '*' })
        .collect()
}

/// Mock gateway client for testing.
pub mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted mock: initiation returns a fixed conversation id and each
    /// `charge_status` call pops the next scripted result.
    pub struct MockMobileMoneyClient {
        conversation_id: String,
        statuses: Mutex<VecDeque<Result<ChargeState>>>,
        pub initiated: Mutex<Vec<(String, i64, String, String)>>,
    }

    impl MockMobileMoneyClient {
        #[must_use]
        pub fn new(conversation_id: impl Into<String>) -> Self {
            Self {
                conversation_id: conversation_id.into(),
                statuses: Mutex::new(VecDeque::new()),
                initiated: Mutex::new(Vec::new()),
            }
        }

        /// Queue the result of the next `charge_status` call.
        pub fn push_status(&self, result: Result<ChargeState>) {
            self.statuses.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl MobileMoneyClient for MockMobileMoneyClient {
        async fn initiate_charge(
            &self,
            phone: &str,
            amount_minor: i64,
            currency: &str,
            reference: &str,
        ) -> Result<ChargeInitiation> {
            self.initiated.lock().unwrap().push((
                phone.to_string(),
                amount_minor,
                currency.to_string(),
                reference.to_string(),
            ));
            Ok(ChargeInitiation {
                conversation_id: self.conversation_id.clone(),
            })
        }

        async fn charge_status(&self, _conversation_id: &str) -> Result<ChargeState> {
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ChargeState::Pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::MockMobileMoneyClient;
    use super::*;
    use crate::sessions::InMemorySessionStore;

    fn test_catalog() -> Catalog {
        Catalog::builder()
            .package("starter")
                .name("Starter")
                .credits(5)
                .price_minor(64_870, "kes")
                .done()
            .build()
    }

    fn adapter(
        client: MockMobileMoneyClient,
    ) -> (
        Arc<InMemorySessionStore>,
        MobileMoneyAdapter<InMemorySessionStore, MockMobileMoneyClient>,
    ) {
        let sessions = Arc::new(InMemorySessionStore::new());
        let adapter = MobileMoneyAdapter::new(sessions.clone(), client, test_catalog());
        (sessions, adapter)
    }

    #[tokio::test]
    async fn test_initiate_creates_session_and_records_ref() {
        let (sessions, adapter) = adapter(MockMobileMoneyClient::new("conv_1"));

        let initiated = adapter.initiate("u1", "starter", "254712345678").await.unwrap();
        assert!(initiated.requires_polling);
        assert_eq!(initiated.phone, "2547******78");

        let session = sessions.get(&initiated.payment_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.provider, PaymentProvider::MobileMoney);
        assert_eq!(session.provider_ref.as_deref(), Some("conv_1"));
        assert_eq!(session.expected_credits, 5);
    }

    #[tokio::test]
    async fn test_initiate_unknown_package() {
        let (_, adapter) = adapter(MockMobileMoneyClient::new("conv_1"));
        assert!(adapter.initiate("u1", "mega", "254712345678").await.is_err());
    }

    #[tokio::test]
    async fn test_poll_pending_then_resolved() {
        let client = MockMobileMoneyClient::new("conv_1");
        client.push_status(Ok(ChargeState::Pending));
        client.push_status(Ok(ChargeState::Pending));
        client.push_status(Ok(ChargeState::Pending));
        client.push_status(Ok(ChargeState::Succeeded));
        let (_, adapter) = adapter(client);

        let payment = adapter.initiate("u1", "starter", "254712345678").await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                adapter.poll(&payment.payment_id).await.unwrap(),
                PollOutcome::StillPending
            );
        }

        match adapter.poll(&payment.payment_id).await.unwrap() {
            PollOutcome::Resolved(intent) => {
                assert_eq!(intent.provider_ref, "conv_1");
                assert_eq!(intent.terminal, TerminalStatus::Succeeded);
                assert_eq!(intent.session_id.as_deref(), Some(payment.payment_id.as_str()));
            }
            other => panic!("expected Resolved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_timeout_is_still_pending() {
        let client = MockMobileMoneyClient::new("conv_1");
        client.push_status(Err(TollgateError::RequestTimeout));
        let (_, adapter) = adapter(client);

        let payment = adapter.initiate("u1", "starter", "254712345678").await.unwrap();
        assert_eq!(
            adapter.poll(&payment.payment_id).await.unwrap(),
            PollOutcome::StillPending
        );
    }

    #[tokio::test]
    async fn test_poll_after_terminal_is_noop() {
        let client = MockMobileMoneyClient::new("conv_1");
        let (sessions, adapter) = adapter(client);

        let payment = adapter.initiate("u1", "starter", "254712345678").await.unwrap();
        sessions
            .transition_if_pending(&payment.payment_id, SessionStatus::Completed)
            .await
            .unwrap();

        assert_eq!(
            adapter.poll(&payment.payment_id).await.unwrap(),
            PollOutcome::AlreadySettled(SessionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_poll_unknown_payment() {
        let (_, adapter) = adapter(MockMobileMoneyClient::new("conv_1"));
        assert!(adapter.poll("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_poll_all_pending_surfaces_resolved() {
        let client = MockMobileMoneyClient::new("conv_1");
        client.push_status(Ok(ChargeState::Succeeded));
        let (_, adapter) = adapter(client);

        let payment = adapter.initiate("u1", "starter", "254712345678").await.unwrap();
        let outcomes = adapter.poll_all_pending().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, payment.payment_id);
        assert!(matches!(outcomes[0].1, PollOutcome::Resolved(_)));
    }

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("254712345678"), "2547******78");
        assert_eq!(mask_phone("0712345678"), "0712****78");
        assert_eq!(mask_phone("12345"), "*****");
        assert_eq!(mask_phone(""), "");
    }
}
