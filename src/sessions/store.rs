//! Storage trait for payment sessions.

use crate::catalog::CreditPackage;
use crate::error::Result;
use crate::utils::unix_now;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which payment rail a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    /// Card processor (signed webhook push).
    Card,
    /// Regional payment aggregator (HMAC webhook push).
    Aggregator,
    /// Mobile-money gateway (no push; polled).
    MobileMoney,
}

impl PaymentProvider {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Aggregator => "aggregator",
            Self::MobileMoney => "mobile_money",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "card" => Some(Self::Card),
            "aggregator" => Some(Self::Aggregator),
            "mobile_money" => Some(Self::MobileMoney),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Awaiting provider resolution.
    Pending,
    /// Money arrived and credits were granted. Terminal.
    Completed,
    /// Provider reported a failed/abandoned payment. Terminal.
    Failed,
    /// Timed out by the expiry sweep without resolution. Terminal.
    Expired,
}

impl SessionStatus {
    /// Whether the session can never change state again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One checkout attempt, from creation through terminal resolution.
///
/// Carries everything reconciliation needs (user, package, expected
/// credits) so a provider event can be settled without re-querying the
/// provider for context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentSession {
    /// Session id (UUID), also used as the mobile-money payment id.
    pub id: String,
    pub user_id: String,
    pub provider: PaymentProvider,
    /// Package id from the static catalog.
    pub package: String,
    /// Credits to grant when the payment settles.
    pub expected_credits: i64,
    /// Price in minor currency units.
    pub amount_minor: i64,
    pub currency: String,
    pub status: SessionStatus,
    /// Provider-side reference (checkout session / order / conversation id).
    /// Recorded after the provider call succeeds; used as the grant's
    /// external ref.
    pub provider_ref: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PaymentSession {
    /// Create a new PENDING session for a catalog package.
    #[must_use]
    pub fn new(user_id: &str, provider: PaymentProvider, package: &CreditPackage) -> Self {
        let now = unix_now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            provider,
            package: package.id.clone(),
            expected_credits: package.credits,
            amount_minor: package.price_minor,
            currency: package.currency.clone(),
            status: SessionStatus::Pending,
            provider_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Trait for storing payment sessions.
///
/// Status changes go through compare-and-set operations that only apply
/// while the session is PENDING; implementations must make those atomic so
/// two racing resolvers cannot both transition the same session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new PENDING session.
    async fn create(&self, session: &PaymentSession) -> Result<()>;

    /// Look up a session by id.
    async fn get(&self, id: &str) -> Result<Option<PaymentSession>>;

    /// Look up a session by its provider reference.
    async fn find_by_provider_ref(
        &self,
        provider: PaymentProvider,
        provider_ref: &str,
    ) -> Result<Option<PaymentSession>>;

    /// Record the provider reference on a PENDING session. Returns false if
    /// the session is missing or already terminal.
    async fn set_provider_ref(&self, id: &str, provider_ref: &str) -> Result<bool>;

    /// Atomically move a PENDING session to `to`. Returns false (no change)
    /// if the session is missing or already terminal.
    async fn transition_if_pending(&self, id: &str, to: SessionStatus) -> Result<bool>;

    /// All PENDING sessions for a provider (used by the polling sweep).
    async fn pending_for_provider(
        &self,
        provider: PaymentProvider,
    ) -> Result<Vec<PaymentSession>>;

    /// Expire every PENDING session created before `cutoff`. Returns the
    /// sessions that were expired by this call.
    async fn expire_created_before(&self, cutoff: u64) -> Result<Vec<PaymentSession>>;
}

/// In-memory session store for development and testing.
#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    inner: std::sync::Arc<std::sync::RwLock<std::collections::HashMap<String, PaymentSession>>>,
}

impl InMemorySessionStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &PaymentSession) -> Result<()> {
        let mut sessions = self.inner.write().unwrap();
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PaymentSession>> {
        Ok(self.inner.read().unwrap().get(id).cloned())
    }

    async fn find_by_provider_ref(
        &self,
        provider: PaymentProvider,
        provider_ref: &str,
    ) -> Result<Option<PaymentSession>> {
        let sessions = self.inner.read().unwrap();
        Ok(sessions
            .values()
            .find(|s| s.provider == provider && s.provider_ref.as_deref() == Some(provider_ref))
            .cloned())
    }

    async fn set_provider_ref(&self, id: &str, provider_ref: &str) -> Result<bool> {
        let mut sessions = self.inner.write().unwrap();
        match sessions.get_mut(id) {
            Some(session) if session.status == SessionStatus::Pending => {
                session.provider_ref = Some(provider_ref.to_string());
                session.updated_at = unix_now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_if_pending(&self, id: &str, to: SessionStatus) -> Result<bool> {
        let mut sessions = self.inner.write().unwrap();
        match sessions.get_mut(id) {
            Some(session) if session.status == SessionStatus::Pending => {
                session.status = to;
                session.updated_at = unix_now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_for_provider(
        &self,
        provider: PaymentProvider,
    ) -> Result<Vec<PaymentSession>> {
        let sessions = self.inner.read().unwrap();
        Ok(sessions
            .values()
            .filter(|s| s.provider == provider && s.status == SessionStatus::Pending)
            .cloned()
            .collect())
    }

    async fn expire_created_before(&self, cutoff: u64) -> Result<Vec<PaymentSession>> {
        let mut sessions = self.inner.write().unwrap();
        let now = unix_now();
        let mut expired = Vec::new();
        for session in sessions.values_mut() {
            if session.status == SessionStatus::Pending && session.created_at < cutoff {
                session.status = SessionStatus::Expired;
                session.updated_at = now;
                expired.push(session.clone());
            }
        }
        Ok(expired)
    }
}
