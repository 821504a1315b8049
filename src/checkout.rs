//! Checkout session orchestration.
//!
//! Creates the local PENDING session *before* contacting the provider, so a
//! crash after provider-side creation but before local persistence cannot
//! orphan a payment the user believes succeeded: the pending row plus the
//! provider's own records are always enough to resolve it later.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

use crate::catalog::{Catalog, CreditPackage};
use crate::error::{Result, TollgateError};
use crate::ledger::LedgerStore;
use crate::payments::error::PaymentError;
use crate::sessions::{PaymentProvider, PaymentSession, SessionStore};

/// Identity collaborator: the checkout path needs a stable user id and an
/// email, nothing more. Implement for whatever your auth layer produces.
pub trait AccountRef: Send + Sync {
    /// Stable identity-provider id; the ledger treats it as opaque.
    fn user_id(&self) -> &str;

    /// Email for receipts and account creation.
    fn email(&self) -> &str;
}

/// What a provider hands back for a created checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCheckout {
    /// Where to send the user's browser.
    pub url: String,
    /// Provider-side reference for the checkout (used to reconcile later).
    pub provider_ref: String,
}

/// Trait for provider checkout APIs (card processor and aggregator).
#[async_trait]
pub trait CheckoutClient: Send + Sync {
    /// Create a provider-side checkout and return the redirect.
    ///
    /// The session id travels in provider metadata so webhooks can be
    /// resolved without guessing.
    async fn create_redirect(
        &self,
        session: &PaymentSession,
        package: &CreditPackage,
        return_url: &str,
    ) -> Result<ProviderCheckout>;
}

/// Checkout configuration.
#[derive(Debug, Clone, Default)]
pub struct CheckoutConfig {
    /// Return-URL domains users may be redirected back to. Empty means any
    /// https URL is accepted.
    pub allowed_return_domains: HashSet<String>,
}

impl CheckoutConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict return URLs to the given domains.
    #[must_use]
    pub fn allowed_return_domains<I, D>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.allowed_return_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Validate a user-supplied return URL.
    ///
    /// Requires https (plain http only for localhost) and, when an
    /// allowlist is configured, a listed domain. An open redirect here
    /// would let an attacker bounce users through the post-payment page.
    pub fn validate_return_url(&self, raw: &str) -> Result<()> {
        let url = Url::parse(raw)
            .map_err(|_| TollgateError::BadRequest(format!("Invalid return URL: {}", raw)))?;

        let host = url
            .host_str()
            .ok_or_else(|| TollgateError::BadRequest("Return URL has no host".to_string()))?;

        let is_localhost = host == "localhost" || host == "127.0.0.1";
        match url.scheme() {
            "https" => {}
            "http" if is_localhost => {}
            scheme => {
                return Err(TollgateError::BadRequest(format!(
                    "Return URL scheme '{}' is not allowed",
                    scheme
                )));
            }
        }

        if !self.allowed_return_domains.is_empty()
            && !self.allowed_return_domains.contains(host)
        {
            return Err(TollgateError::BadRequest(format!(
                "Return domain '{}' is not allowed",
                host
            )));
        }

        Ok(())
    }
}

/// The checkout redirect handed back to the caller.
#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct CheckoutRedirect {
    pub checkout_url: String,
    pub session_id: String,
}

/// Checkout session orchestrator.
pub struct CheckoutManager<L: LedgerStore, S: SessionStore, C: CheckoutClient> {
    ledger: Arc<L>,
    sessions: Arc<S>,
    client: C,
    catalog: Catalog,
    config: CheckoutConfig,
}

impl<L: LedgerStore, S: SessionStore, C: CheckoutClient> CheckoutManager<L, S, C> {
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        sessions: Arc<S>,
        client: C,
        catalog: Catalog,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            ledger,
            sessions,
            client,
            catalog,
            config,
        }
    }

    /// Create a checkout session and return the provider redirect.
    ///
    /// Mobile money does not redirect; use
    /// [`MobileMoneyAdapter::initiate`](crate::payments::MobileMoneyAdapter::initiate)
    /// for that rail.
    pub async fn create_session(
        &self,
        account: &impl AccountRef,
        provider: PaymentProvider,
        package_id: &str,
        return_url: &str,
    ) -> Result<CheckoutRedirect> {
        if provider == PaymentProvider::MobileMoney {
            return Err(TollgateError::BadRequest(
                "Mobile money checkouts are initiated, not redirected".to_string(),
            ));
        }

        self.config.validate_return_url(return_url)?;

        let package = self
            .catalog
            .get(package_id)
            .ok_or_else(|| PaymentError::UnknownPackage {
                package: package_id.to_string(),
            })?;

        // First sight of this identity creates the account.
        self.ledger
            .ensure_account(account.user_id(), account.email())
            .await?;

        // Persist PENDING before the provider knows anything.
        let session = PaymentSession::new(account.user_id(), provider, package);
        self.sessions.create(&session).await?;

        let checkout = self
            .client
            .create_redirect(&session, package, return_url)
            .await?;

        self.sessions
            .set_provider_ref(&session.id, &checkout.provider_ref)
            .await?;

        tracing::info!(
            target: "tollgate::checkout",
            session_id = %session.id,
            provider = %provider,
            package = %package_id,
            "Created checkout session"
        );

        Ok(CheckoutRedirect {
            checkout_url: checkout.url,
            session_id: session.id,
        })
    }
}

// ============================================================================
// Live client
// ============================================================================

/// Configuration for [`LiveCheckoutClient`].
#[derive(Clone)]
pub struct LiveCheckoutConfig {
    /// Card processor API base URL.
    pub card_api_url: String,
    /// Card processor API key.
    pub card_api_key: secrecy::SecretString,
    /// Aggregator API base URL.
    pub aggregator_api_url: String,
    /// Aggregator API key.
    pub aggregator_api_key: secrecy::SecretString,
    /// Per-request timeout in seconds.
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for LiveCheckoutConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCheckoutConfig")
            .field("card_api_url", &self.card_api_url)
            .field("aggregator_api_url", &self.aggregator_api_url)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish_non_exhaustive()
    }
}

/// Live checkout client speaking to the card processor and aggregator APIs.
///
/// The session id rides along as provider metadata / merchant reference so
/// the matching webhook can be resolved without guessing.
pub struct LiveCheckoutClient {
    http: reqwest::Client,
    config: LiveCheckoutConfig,
}

#[derive(serde::Deserialize)]
struct CardCheckoutResponse {
    id: String,
    url: String,
}

#[derive(serde::Deserialize)]
struct AggregatorCheckoutResponse {
    order_id: String,
    checkout_url: String,
}

impl LiveCheckoutClient {
    /// Create a client; every request carries the configured timeout.
    pub fn new(config: LiveCheckoutConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(|e| TollgateError::Internal(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl CheckoutClient for LiveCheckoutClient {
    async fn create_redirect(
        &self,
        session: &PaymentSession,
        package: &CreditPackage,
        return_url: &str,
    ) -> Result<ProviderCheckout> {
        use secrecy::ExposeSecret;

        match session.provider {
            PaymentProvider::Card => {
                let response = self
                    .http
                    .post(format!("{}/checkout/sessions", self.config.card_api_url))
                    .bearer_auth(self.config.card_api_key.expose_secret())
                    .json(&serde_json::json!({
                        "amount_total": package.price_minor,
                        "currency": package.currency,
                        "success_url": return_url,
                        "metadata": {
                            "session_id": session.id,
                            "user_id": session.user_id,
                        },
                    }))
                    .send()
                    .await?
                    .error_for_status()?;

                let created: CardCheckoutResponse = response.json().await?;
                Ok(ProviderCheckout {
                    url: created.url,
                    provider_ref: created.id,
                })
            }
            PaymentProvider::Aggregator => {
                let product = package.provider_product_id.as_deref().ok_or_else(|| {
                    TollgateError::BadRequest(format!(
                        "Package '{}' has no aggregator product mapping",
                        package.id
                    ))
                })?;

                let response = self
                    .http
                    .post(format!("{}/orders", self.config.aggregator_api_url))
                    .bearer_auth(self.config.aggregator_api_key.expose_secret())
                    .json(&serde_json::json!({
                        "product_id": product,
                        "merchant_reference": session.id,
                        "redirect_url": return_url,
                    }))
                    .send()
                    .await?
                    .error_for_status()?;

                let created: AggregatorCheckoutResponse = response.json().await?;
                Ok(ProviderCheckout {
                    url: created.checkout_url,
                    provider_ref: created.order_id,
                })
            }
            PaymentProvider::MobileMoney => Err(TollgateError::BadRequest(
                "Mobile money does not use redirect checkouts".to_string(),
            )),
        }
    }
}

/// Mock checkout client for testing.
pub mod test {
    use super::*;

    /// Mock that returns a deterministic redirect and remembers requests.
    #[derive(Default)]
    pub struct MockCheckoutClient {
        pub requests: std::sync::Mutex<Vec<String>>,
        pub fail_next: std::sync::atomic::AtomicBool,
    }

    impl MockCheckoutClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl CheckoutClient for MockCheckoutClient {
        async fn create_redirect(
            &self,
            session: &PaymentSession,
            _package: &CreditPackage,
            _return_url: &str,
        ) -> Result<ProviderCheckout> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(TollgateError::ServiceUnavailable(
                    "provider down".to_string(),
                ));
            }
            self.requests.lock().unwrap().push(session.id.clone());
            Ok(ProviderCheckout {
                url: format!("https://pay.example.com/c/{}", session.id),
                provider_ref: format!("cs_{}", session.id),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::MockCheckoutClient;
    use super::*;
    use crate::ledger::InMemoryLedgerStore;
    use crate::sessions::{InMemorySessionStore, SessionStatus};

    struct TestAccount;

    impl AccountRef for TestAccount {
        fn user_id(&self) -> &str {
            "u1"
        }
        fn email(&self) -> &str {
            "u1@example.com"
        }
    }

    fn test_catalog() -> Catalog {
        Catalog::builder()
            .package("starter")
                .name("Starter")
                .credits(5)
                .price_minor(499, "usd")
                .done()
            .build()
    }

    fn manager() -> (
        Arc<InMemoryLedgerStore>,
        Arc<InMemorySessionStore>,
        CheckoutManager<InMemoryLedgerStore, InMemorySessionStore, MockCheckoutClient>,
    ) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let manager = CheckoutManager::new(
            ledger.clone(),
            sessions.clone(),
            MockCheckoutClient::new(),
            test_catalog(),
            CheckoutConfig::new(),
        );
        (ledger, sessions, manager)
    }

    #[tokio::test]
    async fn test_create_session_persists_pending_before_redirect() {
        let (ledger, sessions, manager) = manager();

        let redirect = manager
            .create_session(&TestAccount, PaymentProvider::Card, "starter", "https://app.example.com/done")
            .await
            .unwrap();

        let session = sessions.get(&redirect.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.expected_credits, 5);
        assert_eq!(
            session.provider_ref.as_deref(),
            Some(format!("cs_{}", redirect.session_id).as_str())
        );
        assert!(redirect.checkout_url.contains(&redirect.session_id));

        // First sight created the account, with zero credits.
        assert!(ledger.get_account("u1").await.unwrap().is_some());
        assert_eq!(ledger.balance("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_package_rejected() {
        let (_, _, manager) = manager();
        let err = manager
            .create_session(&TestAccount, PaymentProvider::Card, "mega", "https://app.example.com/done")
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_mobile_money_rejected() {
        let (_, _, manager) = manager();
        assert!(manager
            .create_session(&TestAccount, PaymentProvider::MobileMoney, "starter", "https://app.example.com/done")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pending_session_survives_provider_failure() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let client = MockCheckoutClient::new();
        client.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let manager = CheckoutManager::new(
            ledger,
            sessions.clone(),
            client,
            test_catalog(),
            CheckoutConfig::new(),
        );

        assert!(manager
            .create_session(&TestAccount, PaymentProvider::Card, "starter", "https://app.example.com/done")
            .await
            .is_err());

        // The local row exists (PENDING, no ref) for the sweep to clean up.
        let pending = sessions
            .pending_for_provider(PaymentProvider::Card)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].provider_ref.is_none());
    }

    #[test]
    fn test_validate_return_url() {
        let open = CheckoutConfig::new();
        assert!(open.validate_return_url("https://app.example.com/done").is_ok());
        assert!(open.validate_return_url("http://localhost:3000/done").is_ok());
        assert!(open.validate_return_url("http://app.example.com/done").is_err());
        assert!(open.validate_return_url("javascript:alert(1)").is_err());
        assert!(open.validate_return_url("not a url").is_err());

        let restricted = CheckoutConfig::new().allowed_return_domains(["app.example.com"]);
        assert!(restricted.validate_return_url("https://app.example.com/done").is_ok());
        assert!(restricted.validate_return_url("https://evil.example.com/done").is_err());
    }
}
