//! PostgreSQL-backed session store.
//!
//! Status transitions are single conditional UPDATEs guarded on
//! `status = 'pending'`, which gives the compare-and-set semantics the
//! reconciliation engine relies on without row locks held across awaits.

use crate::error::{Result, TollgateError};
use crate::utils::unix_now;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::store::{PaymentProvider, PaymentSession, SessionStatus, SessionStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS payment_sessions (
    id               TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL,
    provider         TEXT NOT NULL,
    package          TEXT NOT NULL,
    expected_credits BIGINT NOT NULL,
    amount_minor     BIGINT NOT NULL,
    currency         TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    provider_ref     TEXT,
    created_at       BIGINT NOT NULL,
    updated_at       BIGINT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS payment_sessions_provider_ref_idx
    ON payment_sessions (provider, provider_ref)
    WHERE provider_ref IS NOT NULL;

CREATE INDEX IF NOT EXISTS payment_sessions_status_idx
    ON payment_sessions (status, provider, created_at);
"#;

/// PostgreSQL implementation of [`SessionStore`].
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the session table if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<PaymentSession> {
        let provider: String = row.get("provider");
        let status: String = row.get("status");
        Ok(PaymentSession {
            id: row.get("id"),
            user_id: row.get("user_id"),
            provider: PaymentProvider::from_str(&provider).ok_or_else(|| {
                TollgateError::Database(format!("unknown provider: {}", provider))
            })?,
            package: row.get("package"),
            expected_credits: row.get("expected_credits"),
            amount_minor: row.get("amount_minor"),
            currency: row.get("currency"),
            status: SessionStatus::from_str(&status)
                .ok_or_else(|| TollgateError::Database(format!("unknown status: {}", status)))?,
            provider_ref: row.get("provider_ref"),
            created_at: row.get::<i64, _>("created_at") as u64,
            updated_at: row.get::<i64, _>("updated_at") as u64,
        })
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: &PaymentSession) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO payment_sessions
                   (id, user_id, provider, package, expected_credits,
                    amount_minor, currency, status, provider_ref, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(session.provider.as_str())
        .bind(&session.package)
        .bind(session.expected_credits)
        .bind(session.amount_minor)
        .bind(&session.currency)
        .bind(session.status.as_str())
        .bind(&session.provider_ref)
        .bind(session.created_at as i64)
        .bind(session.updated_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PaymentSession>> {
        let row = sqlx::query("SELECT * FROM payment_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn find_by_provider_ref(
        &self,
        provider: PaymentProvider,
        provider_ref: &str,
    ) -> Result<Option<PaymentSession>> {
        let row = sqlx::query(
            "SELECT * FROM payment_sessions WHERE provider = $1 AND provider_ref = $2",
        )
        .bind(provider.as_str())
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn set_provider_ref(&self, id: &str, provider_ref: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"UPDATE payment_sessions SET provider_ref = $2, updated_at = $3
               WHERE id = $1 AND status = 'pending'"#,
        )
        .bind(id)
        .bind(provider_ref)
        .bind(unix_now() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn transition_if_pending(&self, id: &str, to: SessionStatus) -> Result<bool> {
        let updated = sqlx::query(
            r#"UPDATE payment_sessions SET status = $2, updated_at = $3
               WHERE id = $1 AND status = 'pending'"#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(unix_now() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn pending_for_provider(
        &self,
        provider: PaymentProvider,
    ) -> Result<Vec<PaymentSession>> {
        let rows = sqlx::query(
            "SELECT * FROM payment_sessions WHERE provider = $1 AND status = 'pending'",
        )
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn expire_created_before(&self, cutoff: u64) -> Result<Vec<PaymentSession>> {
        let rows = sqlx::query(
            r#"UPDATE payment_sessions SET status = 'expired', updated_at = $2
               WHERE status = 'pending' AND created_at < $1
               RETURNING *"#,
        )
        .bind(cutoff as i64)
        .bind(unix_now() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::from_row).collect()
    }
}
