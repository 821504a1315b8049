//! PostgreSQL-backed ledger store.
//!
//! The atomicity story is delegated to the database: the grant idempotency
//! guard is the unique index on `ledger_entries.external_ref` (claimed with
//! `INSERT ... ON CONFLICT DO NOTHING` inside the same transaction as the
//! balance update), and the debit path is a single conditional
//! `UPDATE ... WHERE balance >= $amount`. Neither operation ever reads a
//! balance in one statement and writes it in another.

use crate::error::{Result, TollgateError};
use crate::utils::unix_now;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::store::{Account, DebitOutcome, EntryKind, GrantOutcome, LedgerEntry, LedgerStore};

/// Schema used by [`PgLedgerStore`]. Applied by [`PgLedgerStore::migrate`].
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    user_id     TEXT PRIMARY KEY,
    email       TEXT NOT NULL DEFAULT '',
    active      BOOLEAN NOT NULL DEFAULT TRUE,
    balance     BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
    created_at  BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id           TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    kind         TEXT NOT NULL,
    amount       BIGINT NOT NULL,
    reason       TEXT NOT NULL,
    external_ref TEXT UNIQUE,
    created_at   BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS ledger_entries_user_idx
    ON ledger_entries (user_id, created_at DESC);
"#;

/// PostgreSQL implementation of [`LedgerStore`].
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ledger tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_balance(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: &str,
        delta: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"INSERT INTO accounts (user_id, balance, created_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id)
               DO UPDATE SET balance = accounts.balance + EXCLUDED.balance
               RETURNING balance"#,
        )
        .bind(user_id)
        .bind(delta)
        .bind(unix_now() as i64)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.get("balance"))
    }

    async fn insert_entry(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: &str,
        kind: EntryKind,
        amount: i64,
        reason: &str,
        external_ref: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO ledger_entries (id, user_id, kind, amount, reason, external_ref, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(kind.as_str())
        .bind(amount)
        .bind(reason)
        .bind(external_ref)
        .bind(unix_now() as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn require_positive(amount: i64, op: &str) -> Result<()> {
        if amount <= 0 {
            return Err(TollgateError::BadRequest(format!(
                "{} amount must be positive, got {}",
                op, amount
            )));
        }
        Ok(())
    }

    async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        kind: EntryKind,
        reason: &str,
    ) -> Result<GrantOutcome> {
        let mut tx = self.pool.begin().await?;
        Self::insert_entry(&mut tx, user_id, kind, amount, reason, None).await?;
        let balance = Self::upsert_balance(&mut tx, user_id, amount).await?;
        tx.commit().await?;
        Ok(GrantOutcome {
            applied: true,
            balance,
        })
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_account(&self, user_id: &str, email: &str) -> Result<Account> {
        let row = sqlx::query(
            r#"INSERT INTO accounts (user_id, email, created_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
               RETURNING user_id, email, active, created_at"#,
        )
        .bind(user_id)
        .bind(email)
        .bind(unix_now() as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(Account {
            user_id: row.get("user_id"),
            email: row.get("email"),
            active: row.get("active"),
            created_at: row.get::<i64, _>("created_at") as u64,
        })
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT user_id, email, active, created_at FROM accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Account {
            user_id: r.get("user_id"),
            email: r.get("email"),
            active: r.get("active"),
            created_at: r.get::<i64, _>("created_at") as u64,
        }))
    }

    async fn deactivate_account(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET active = FALSE WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT balance FROM accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("balance")).unwrap_or(0))
    }

    async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        external_ref: &str,
        reason: &str,
    ) -> Result<GrantOutcome> {
        Self::require_positive(amount, "grant")?;
        let mut tx = self.pool.begin().await?;

        // The unique index on external_ref decides who wins a race; the
        // loser sees zero rows affected and reports a duplicate.
        let inserted = sqlx::query(
            r#"INSERT INTO ledger_entries (id, user_id, kind, amount, reason, external_ref, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (external_ref) DO NOTHING"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(EntryKind::Grant.as_str())
        .bind(amount)
        .bind(reason)
        .bind(external_ref)
        .bind(unix_now() as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            let balance = self.balance(user_id).await?;
            return Ok(GrantOutcome {
                applied: false,
                balance,
            });
        }

        let balance = Self::upsert_balance(&mut tx, user_id, amount).await?;
        tx.commit().await?;
        Ok(GrantOutcome {
            applied: true,
            balance,
        })
    }

    async fn debit(&self, user_id: &str, amount: i64, reason: &str) -> Result<DebitOutcome> {
        Self::require_positive(amount, "debit")?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"UPDATE accounts SET balance = balance - $2
               WHERE user_id = $1 AND balance >= $2
               RETURNING balance"#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            let balance = self.balance(user_id).await?;
            return Ok(DebitOutcome {
                applied: false,
                balance,
            });
        };

        Self::insert_entry(&mut tx, user_id, EntryKind::Debit, -amount, reason, None).await?;
        tx.commit().await?;
        Ok(DebitOutcome {
            applied: true,
            balance: row.get("balance"),
        })
    }

    async fn refund(&self, user_id: &str, amount: i64, reason: &str) -> Result<GrantOutcome> {
        Self::require_positive(amount, "refund")?;
        self.credit(user_id, amount, EntryKind::Refund, reason).await
    }

    async fn bonus(&self, user_id: &str, amount: i64, reason: &str) -> Result<GrantOutcome> {
        Self::require_positive(amount, "bonus")?;
        self.credit(user_id, amount, EntryKind::Bonus, reason).await
    }

    async fn entries(&self, user_id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"SELECT id, user_id, kind, amount, reason, external_ref, created_at
               FROM ledger_entries
               WHERE user_id = $1
               ORDER BY created_at DESC, id DESC
               LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let kind: String = r.get("kind");
                Ok(LedgerEntry {
                    id: r.get("id"),
                    user_id: r.get("user_id"),
                    kind: EntryKind::from_str(&kind).ok_or_else(|| {
                        TollgateError::Database(format!("unknown entry kind: {}", kind))
                    })?,
                    amount: r.get("amount"),
                    reason: r.get("reason"),
                    external_ref: r.get("external_ref"),
                    created_at: r.get::<i64, _>("created_at") as u64,
                })
            })
            .collect()
    }
}
