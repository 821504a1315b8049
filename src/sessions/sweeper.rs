//! Background expiry of stale PENDING sessions.
//!
//! EXPIRED is reachable only from this sweep, never from user action, so a
//! user "cancelling" can't race a late success webhook into a terminal
//! state. A success that arrives after expiry hits the reconciliation
//! engine's terminal short-circuit and is not granted.

use crate::error::Result;
use crate::sessions::SessionStore;
use crate::utils::{get_env_with_prefix, unix_now};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the session expiry sweep.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Seconds a session may stay PENDING before it is expired.
    pub session_ttl_seconds: u64,
    /// Seconds between sweeps.
    pub sweep_interval_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            // Providers abandon unresolved checkouts within a day.
            session_ttl_seconds: 24 * 60 * 60,
            sweep_interval_seconds: 5 * 60,
        }
    }
}

impl SweeperConfig {
    /// Load from `SESSION_TTL_SECONDS` / `SESSION_SWEEP_INTERVAL_SECONDS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ttl) = get_env_with_prefix("SESSION_TTL_SECONDS") {
            if let Ok(val) = ttl.parse() {
                config.session_ttl_seconds = val;
            }
        }
        if let Some(interval) = get_env_with_prefix("SESSION_SWEEP_INTERVAL_SECONDS") {
            if let Ok(val) = interval.parse() {
                config.sweep_interval_seconds = val;
            }
        }
        config
    }
}

/// Periodic expiry sweep over a [`SessionStore`].
pub struct SessionSweeper<S: SessionStore> {
    store: Arc<S>,
    config: SweeperConfig,
}

impl<S: SessionStore + 'static> SessionSweeper<S> {
    #[must_use]
    pub fn new(store: Arc<S>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// Run one sweep now. Returns the number of sessions expired.
    pub async fn sweep_once(&self) -> Result<usize> {
        let cutoff = unix_now().saturating_sub(self.config.session_ttl_seconds);
        let expired = self.store.expire_created_before(cutoff).await?;
        if !expired.is_empty() {
            tracing::info!(
                target: "tollgate::sessions",
                count = expired.len(),
                "Expired stale pending sessions"
            );
        }
        Ok(expired.len())
    }

    /// Spawn the sweep loop on the current runtime.
    ///
    /// The task runs until the returned handle is aborted. Sweep errors are
    /// logged and the loop continues; a transient storage failure must not
    /// kill expiry for the life of the process.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so startup isn't
            // racing stores that are still migrating.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_once().await {
                    tracing::warn!(
                        target: "tollgate::sessions",
                        error = %err,
                        "Session expiry sweep failed"
                    );
                }
            }
        })
    }
}
