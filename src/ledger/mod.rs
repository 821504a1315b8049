//! Credit ledger: balances plus an append-only transaction log.
//!
//! The ledger is the single source of truth for spendable credits. Every
//! balance mutation goes through [`LedgerStore`] and appends an immutable
//! [`LedgerEntry`]; summing a user's entries always reproduces their
//! balance. The uniqueness of `external_ref` across entries is the
//! idempotency guard for provider-sourced grants: a duplicate reference is
//! reported as `applied: false` by the same atomic operation that would have
//! granted, so two callers racing the same payment can never both credit it.

pub mod store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use store::{
    Account, DebitOutcome, EntryKind, GrantOutcome, InMemoryLedgerStore, LedgerEntry, LedgerStore,
};

#[cfg(feature = "postgres")]
pub use postgres::PgLedgerStore;
