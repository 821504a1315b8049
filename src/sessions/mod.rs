//! Payment sessions: the local record of one checkout attempt.
//!
//! A session is created PENDING before the user is sent to a provider and
//! resolves to exactly one terminal state (COMPLETED, FAILED, or EXPIRED).
//! Terminal states are one-way: every transition goes through a
//! compare-and-set that only fires while the session is still PENDING, so a
//! late webhook can never flip a settled session.

pub mod store;
pub mod sweeper;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use store::{
    InMemorySessionStore, PaymentProvider, PaymentSession, SessionStatus, SessionStore,
};
pub use sweeper::{SessionSweeper, SweeperConfig};

#[cfg(feature = "postgres")]
pub use postgres::PgSessionStore;
