//! Storage trait for the credit ledger.
//!
//! Implement [`LedgerStore`] to persist balances and entries to your
//! database. An in-memory implementation is provided for development and
//! testing; the `postgres` feature adds a SQL-backed one.

use crate::error::Result;
use crate::utils::unix_now;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of a ledger entry. The signed interpretation of `amount` follows
/// from the kind; the operations themselves only accept positive amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Credits purchased through a payment provider.
    Grant,
    /// Credits consumed by a billable action.
    Debit,
    /// Credits returned after a reversed charge.
    Refund,
    /// Promotional credits, no money attached.
    Bonus,
}

impl EntryKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Debit => "debit",
            Self::Refund => "refund",
            Self::Bonus => "bonus",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "grant" => Some(Self::Grant),
            "debit" => Some(Self::Debit),
            "refund" => Some(Self::Refund),
            "bonus" => Some(Self::Bonus),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable row of the append-only transaction log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Entry id (UUID).
    pub id: String,
    /// Owning user, an opaque identity-provider id.
    pub user_id: String,
    /// What kind of movement this is.
    pub kind: EntryKind,
    /// Signed credit delta: positive for grant/refund/bonus, negative for debit.
    pub amount: i64,
    /// Human-readable reason (package id, action label, operator note).
    pub reason: String,
    /// Provider payment reference. Unique across all entries when present;
    /// this uniqueness IS the idempotency guard.
    pub external_ref: Option<String>,
    /// Creation time (Unix seconds).
    pub created_at: u64,
}

/// A user account as the ledger sees it: an opaque id and a lifecycle flag.
/// Accounts are created on first sight and deactivated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub user_id: String,
    pub email: String,
    pub active: bool,
    pub created_at: u64,
}

/// Outcome of a grant/refund/bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantOutcome {
    /// False when the external reference was already granted (duplicate).
    pub applied: bool,
    /// Balance after the operation (unchanged when not applied).
    pub balance: i64,
}

/// Outcome of a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebitOutcome {
    /// False when the balance was insufficient; nothing changed.
    pub applied: bool,
    /// Balance after the operation (unchanged when not applied).
    pub balance: i64,
}

/// Trait for storing ledger state.
///
/// Every mutation must be atomic with respect to concurrent callers:
/// `grant` relies on a uniqueness constraint over `external_ref` (not a
/// check-then-act lookup) and `debit` on a conditional decrement (not
/// read-balance-then-write). Implementations that cannot provide those
/// guarantees will double-credit and overdraw under load.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the account if it does not exist yet; returns the stored row.
    async fn ensure_account(&self, user_id: &str, email: &str) -> Result<Account>;

    /// Look up an account.
    async fn get_account(&self, user_id: &str) -> Result<Option<Account>>;

    /// Mark an account inactive. The ledger history is retained.
    async fn deactivate_account(&self, user_id: &str) -> Result<()>;

    /// Current balance; 0 for an unknown user.
    async fn balance(&self, user_id: &str) -> Result<i64>;

    /// Atomically append a GRANT entry keyed by `external_ref` and credit
    /// the balance. A duplicate `external_ref` yields `applied: false` with
    /// no state change, even when two callers race the same reference.
    async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        external_ref: &str,
        reason: &str,
    ) -> Result<GrantOutcome>;

    /// Atomically verify `balance >= amount`, decrement, and append a DEBIT
    /// entry. Insufficient balance yields `applied: false` with no change.
    async fn debit(&self, user_id: &str, amount: i64, reason: &str) -> Result<DebitOutcome>;

    /// Credit back a reversed charge. Always applies.
    async fn refund(&self, user_id: &str, amount: i64, reason: &str) -> Result<GrantOutcome>;

    /// Promotional credit with no payment attached. Always applies.
    async fn bonus(&self, user_id: &str, amount: i64, reason: &str) -> Result<GrantOutcome>;

    /// Most recent entries for a user, newest first.
    async fn entries(&self, user_id: &str, limit: usize) -> Result<Vec<LedgerEntry>>;
}

fn require_positive(amount: i64, op: &str) -> Result<()> {
    if amount <= 0 {
        return Err(crate::error::TollgateError::BadRequest(format!(
            "{} amount must be positive, got {}",
            op, amount
        )));
    }
    Ok(())
}

/// In-memory ledger store for development and testing.
///
/// All state lives behind a single lock so every operation observes and
/// mutates balance, entries, and the external-ref index atomically, matching
/// the transactional guarantees a SQL implementation gets from the database.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    inner: std::sync::Arc<std::sync::RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    accounts: std::collections::HashMap<String, Account>,
    balances: std::collections::HashMap<String, i64>,
    entries: Vec<LedgerEntry>,
    external_refs: std::collections::HashSet<String>,
}

impl InMemoryLedgerStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all entry amounts for a user. Test helper for the
    /// ledger/balance consistency invariant.
    pub fn entries_total(&self, user_id: &str) -> i64 {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.amount)
            .sum()
    }

    fn push_credit(
        inner: &mut Inner,
        user_id: &str,
        amount: i64,
        kind: EntryKind,
        reason: &str,
        external_ref: Option<String>,
    ) -> i64 {
        // First sight of this identity: a grant can arrive before the user
        // ever hit the checkout path (manual operator credit, migration).
        inner
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Account {
                user_id: user_id.to_string(),
                email: String::new(),
                active: true,
                created_at: unix_now(),
            });
        let balance = inner.balances.entry(user_id.to_string()).or_insert(0);
        *balance += amount;
        let balance = *balance;
        inner.entries.push(LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            amount,
            reason: reason.to_string(),
            external_ref,
            created_at: unix_now(),
        });
        balance
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn ensure_account(&self, user_id: &str, email: &str) -> Result<Account> {
        let mut inner = self.inner.write().unwrap();
        let account = inner
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Account {
                user_id: user_id.to_string(),
                email: email.to_string(),
                active: true,
                created_at: unix_now(),
            })
            .clone();
        inner.balances.entry(user_id.to_string()).or_insert(0);
        Ok(account)
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>> {
        Ok(self.inner.read().unwrap().accounts.get(user_id).cloned())
    }

    async fn deactivate_account(&self, user_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(account) = inner.accounts.get_mut(user_id) {
            account.active = false;
        }
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        external_ref: &str,
        reason: &str,
    ) -> Result<GrantOutcome> {
        require_positive(amount, "grant")?;
        let mut inner = self.inner.write().unwrap();

        // The insert below doubles as the uniqueness check; both happen
        // under the same lock, so racing callers serialize here exactly the
        // way a unique index serializes concurrent INSERTs.
        if !inner.external_refs.insert(external_ref.to_string()) {
            let balance = inner.balances.get(user_id).copied().unwrap_or(0);
            return Ok(GrantOutcome {
                applied: false,
                balance,
            });
        }

        let balance = Self::push_credit(
            &mut inner,
            user_id,
            amount,
            EntryKind::Grant,
            reason,
            Some(external_ref.to_string()),
        );
        Ok(GrantOutcome {
            applied: true,
            balance,
        })
    }

    async fn debit(&self, user_id: &str, amount: i64, reason: &str) -> Result<DebitOutcome> {
        require_positive(amount, "debit")?;
        let mut inner = self.inner.write().unwrap();

        let current = inner.balances.get(user_id).copied().unwrap_or(0);
        if current < amount {
            return Ok(DebitOutcome {
                applied: false,
                balance: current,
            });
        }

        let balance = current - amount;
        inner.balances.insert(user_id.to_string(), balance);
        inner.entries.push(LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind: EntryKind::Debit,
            amount: -amount,
            reason: reason.to_string(),
            external_ref: None,
            created_at: unix_now(),
        });
        Ok(DebitOutcome {
            applied: true,
            balance,
        })
    }

    async fn refund(&self, user_id: &str, amount: i64, reason: &str) -> Result<GrantOutcome> {
        require_positive(amount, "refund")?;
        let mut inner = self.inner.write().unwrap();
        let balance = Self::push_credit(&mut inner, user_id, amount, EntryKind::Refund, reason, None);
        Ok(GrantOutcome {
            applied: true,
            balance,
        })
    }

    async fn bonus(&self, user_id: &str, amount: i64, reason: &str) -> Result<GrantOutcome> {
        require_positive(amount, "bonus")?;
        let mut inner = self.inner.write().unwrap();
        let balance = Self::push_credit(&mut inner, user_id, amount, EntryKind::Bonus, reason, None);
        Ok(GrantOutcome {
            applied: true,
            balance,
        })
    }

    async fn entries(&self, user_id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<LedgerEntry> = inner
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }
}
