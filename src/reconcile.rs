//! Reconciliation engine: turns verified provider intents into ledger
//! grants and session transitions.
//!
//! Per-session state machine: `PENDING -> {COMPLETED | FAILED | EXPIRED}`,
//! one-way. The engine is the only writer of session status after creation
//! and the only creator of provider-sourced ledger entries.
//!
//! Ordering on success is grant-then-mark-complete, deliberately: if the
//! process dies between the two, a retry re-enters with the session still
//! PENDING, the ledger's external-ref guard reports the grant as a
//! duplicate, and the session is still advanced to COMPLETED. The crash
//! window heals itself without ever granting twice.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ledger::LedgerStore;
use crate::payments::error::PaymentError;
use crate::payments::{PaymentIntent, TerminalStatus};
use crate::sessions::{SessionStatus, SessionStore};

/// What a reconcile call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Credits granted and session completed.
    Granted { balance: i64 },
    /// The grant already existed (webhook retry, or a crash between grant
    /// and completion); session is completed, nothing was credited again.
    /// This is normal operation, not an error.
    Duplicate,
    /// Provider reported failure; session marked FAILED, ledger untouched.
    MarkedFailed,
    /// The session was already terminal; nothing changed.
    AlreadyTerminal(SessionStatus),
}

impl ReconcileOutcome {
    /// The session status after this call.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Granted { .. } | Self::Duplicate => SessionStatus::Completed,
            Self::MarkedFailed => SessionStatus::Failed,
            Self::AlreadyTerminal(status) => *status,
        }
    }
}

/// The reconciliation engine.
pub struct ReconciliationEngine<L: LedgerStore, S: SessionStore> {
    ledger: Arc<L>,
    sessions: Arc<S>,
}

impl<L: LedgerStore, S: SessionStore> ReconciliationEngine<L, S> {
    #[must_use]
    pub fn new(ledger: Arc<L>, sessions: Arc<S>) -> Self {
        Self { ledger, sessions }
    }

    /// Resolve the session an intent refers to, then reconcile it.
    ///
    /// Resolution prefers the session id echoed back in provider metadata
    /// and falls back to the recorded provider reference. An intent that
    /// matches neither is a [`PaymentError::SessionMismatch`]: rejected
    /// without touching the ledger.
    pub async fn process(&self, intent: &PaymentIntent) -> Result<ReconcileOutcome> {
        let mut session = None;
        if let Some(id) = &intent.session_id {
            session = self.sessions.get(id).await?;
        }
        if session.is_none() {
            session = self
                .sessions
                .find_by_provider_ref(intent.provider, &intent.provider_ref)
                .await?;
        }

        let session = session.ok_or_else(|| PaymentError::SessionMismatch {
            provider_ref: intent.provider_ref.clone(),
        })?;

        self.reconcile(&session.id, intent).await
    }

    /// Reconcile one session against a verified provider intent.
    ///
    /// Safe to call repeatedly and concurrently with the same input:
    /// terminal sessions short-circuit, and the grant is idempotent on the
    /// provider reference.
    pub async fn reconcile(
        &self,
        session_id: &str,
        intent: &PaymentIntent,
    ) -> Result<ReconcileOutcome> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| PaymentError::UnknownSession {
                session_id: session_id.to_string(),
            })?;

        // Step 1: terminal sessions are settled history. This is what makes
        // webhook retries and duplicate polls safe.
        if session.status.is_terminal() {
            tracing::debug!(
                target: "tollgate::reconcile",
                session_id = %session_id,
                status = %session.status,
                "Skipping reconcile of terminal session"
            );
            return Ok(ReconcileOutcome::AlreadyTerminal(session.status));
        }

        // Step 2: the event must refer to this session.
        if session.provider != intent.provider {
            return Err(PaymentError::SessionMismatch {
                provider_ref: intent.provider_ref.clone(),
            }
            .into());
        }
        match &session.provider_ref {
            Some(recorded) if recorded != &intent.provider_ref => {
                return Err(PaymentError::SessionMismatch {
                    provider_ref: intent.provider_ref.clone(),
                }
                .into());
            }
            Some(_) => {}
            // Checkout crashed before recording the reference; adopt the
            // provider's so the grant below is keyed consistently.
            None => {
                self.sessions
                    .set_provider_ref(session_id, &intent.provider_ref)
                    .await?;
            }
        }

        match intent.terminal {
            TerminalStatus::Succeeded => {
                // Step 3: grant first. If this errors the session stays
                // PENDING and the whole sequence can be retried safely.
                let grant = self
                    .ledger
                    .grant(
                        &session.user_id,
                        session.expected_credits,
                        &intent.provider_ref,
                        &session.package,
                    )
                    .await?;

                self.sessions
                    .transition_if_pending(session_id, SessionStatus::Completed)
                    .await?;

                if grant.applied {
                    tracing::info!(
                        target: "tollgate::reconcile",
                        session_id = %session_id,
                        user_id = %session.user_id,
                        credits = session.expected_credits,
                        provider_ref = %intent.provider_ref,
                        "Granted credits for settled payment"
                    );
                    Ok(ReconcileOutcome::Granted {
                        balance: grant.balance,
                    })
                } else {
                    // Retried webhook for an already-granted payment, or the
                    // tail of the grant-then-crash window.
                    tracing::info!(
                        target: "tollgate::reconcile",
                        session_id = %session_id,
                        provider_ref = %intent.provider_ref,
                        "Duplicate grant suppressed"
                    );
                    Ok(ReconcileOutcome::Duplicate)
                }
            }
            TerminalStatus::Failed => {
                // Step 4: failure never touches the ledger.
                self.sessions
                    .transition_if_pending(session_id, SessionStatus::Failed)
                    .await?;
                tracing::info!(
                    target: "tollgate::reconcile",
                    session_id = %session_id,
                    provider_ref = %intent.provider_ref,
                    "Marked session failed"
                );
                Ok(ReconcileOutcome::MarkedFailed)
            }
        }
    }
}

/// Retry a transient-failing operation with exponential backoff.
///
/// Used at call sites that hit storage contention or provider hiccups;
/// non-transient errors propagate immediately so a hard rejection is never
/// papered over by retrying.
pub async fn retry_transient<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < max_attempts && is_transient(&err) => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                tracing::warn!(
                    target: "tollgate::reconcile",
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &TollgateError) -> bool {
    match err {
        TollgateError::ServiceUnavailable(_) | TollgateError::RequestTimeout => true,
        #[cfg(feature = "postgres")]
        TollgateError::Database(_) => true,
        _ => false,
    }
}
