//! Tollgate - credit ledger and payment reconciliation engine
//!
//! Tollgate converts money received through three independent payment rails
//! (card processor, regional aggregator, mobile-money gateway) into an
//! authoritative, race-free balance of spendable credits, and debits those
//! credits exactly once per billable action.
//!
//! # Guarantees
//!
//! - **No double credit**: a payment reference grants at most once, enforced
//!   by a uniqueness constraint inside the grant transaction, not by
//!   check-then-act.
//! - **No negative balance**: debits are atomic conditional decrements; two
//!   browser tabs cannot jointly overspend.
//! - **Replay-safe reconciliation**: webhook retries, duplicate polls, and
//!   crash-retry loops all converge on the same final state.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollgate::catalog::Catalog;
//! use tollgate::ledger::InMemoryLedgerStore;
//! use tollgate::reconcile::ReconciliationEngine;
//! use tollgate::sessions::InMemorySessionStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     tollgate::init_tracing();
//!
//!     let catalog = Catalog::builder()
//!         .package("starter")
//!             .name("Starter")
//!             .credits(5)
//!             .price_minor(499, "usd")
//!             .done()
//!         .build();
//!
//!     let ledger = Arc::new(InMemoryLedgerStore::new());
//!     let sessions = Arc::new(InMemorySessionStore::new());
//!     let engine = ReconciliationEngine::new(ledger, sessions);
//!     // wire engine + adapters into tollgate::http::router(...)
//!     let _ = (catalog, engine);
//! }
//! ```

pub mod catalog;
pub mod checkout;
mod error;
pub mod http;
pub mod ledger;
pub mod metering;
pub mod payments;
pub mod ratelimit;
pub mod reconcile;
pub mod sessions;
pub mod utils;

// Re-exports for public API
pub use catalog::{Catalog, CreditPackage};
pub use checkout::{
    AccountRef, CheckoutClient, CheckoutConfig, CheckoutManager, CheckoutRedirect,
    LiveCheckoutClient, LiveCheckoutConfig, ProviderCheckout,
};
pub use error::{Result, TollgateError};
pub use http::{PaymentsState, router};
pub use ledger::{
    Account, DebitOutcome, EntryKind, GrantOutcome, InMemoryLedgerStore, LedgerEntry, LedgerStore,
};
pub use metering::{ActionCosts, BillableAction, ChargeOutcome, UsageMeter};
pub use payments::{
    AggregatorWebhook, CardWebhook, MobileMoneyAdapter, MobileMoneyClient, MobileMoneyConfig,
    PaymentError, PaymentIntent, PollOutcome, TerminalStatus,
};
pub use ratelimit::{FixedWindowLimiter, RateDecision, RateLimitConfig};
pub use reconcile::{ReconcileOutcome, ReconciliationEngine, retry_transient};
pub use sessions::{
    InMemorySessionStore, PaymentProvider, PaymentSession, SessionStatus, SessionStore,
    SessionSweeper, SweeperConfig,
};

#[cfg(feature = "postgres")]
pub use ledger::PgLedgerStore;
#[cfg(feature = "postgres")]
pub use sessions::PgSessionStore;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// Call early in your application, typically in main() before wiring the
/// engine.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "tollgate=debug")
/// - `TOLLGATE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TOLLGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
