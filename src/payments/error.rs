//! Payment-specific error types.
//!
//! Granular errors for the verification, checkout, and reconciliation
//! paths. Note what is deliberately absent: a duplicate provider event is
//! not an error — it is reported as a successful no-op outcome so webhook
//! retries get a 2xx and stop.

use std::fmt;

/// Payment-specific errors.
///
/// Convertible to [`TollgateError`](crate::error::TollgateError) for HTTP
/// responses; the conversion decides which failures providers are allowed
/// to retry (5xx) and which they must not (4xx).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    // Verification errors — rejected before any ledger access
    /// Webhook signature did not verify.
    VerificationFailed { provider: &'static str },
    /// Webhook timestamp outside the accepted window (replay protection).
    StaleTimestamp { age_seconds: i64 },
    /// Event payload could not be parsed.
    MalformedPayload { message: String },

    // Resolution errors
    /// Event references a session that does not match its recorded provider
    /// reference, or no session at all.
    SessionMismatch { provider_ref: String },
    /// No session with this id.
    UnknownSession { session_id: String },
    /// Package id not present in the catalog.
    UnknownPackage { package: String },

    // Debit path
    /// Balance too low for the requested action.
    InsufficientCredits { needed: i64, available: i64 },

    // Provider transport
    /// A provider call exceeded its deadline. Retried later; never treated
    /// as a terminal payment failure.
    ProviderTimeout { operation: String },
    /// Provider API returned an error.
    Provider {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },

    // Storage
    /// Transaction/lock contention; retry with backoff at the call site.
    PersistenceConflict { detail: String },

    /// Unexpected internal failure.
    Internal { message: String },
}

impl fmt::Display for PaymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed { provider } => {
                write!(f, "Webhook signature verification failed for {}", provider)
            }
            Self::StaleTimestamp { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::MalformedPayload { message } => {
                write!(f, "Invalid provider payload: {}", message)
            }
            Self::SessionMismatch { provider_ref } => {
                write!(f, "Event reference '{}' does not match any session", provider_ref)
            }
            Self::UnknownSession { session_id } => {
                write!(f, "Unknown payment session: {}", session_id)
            }
            Self::UnknownPackage { package } => {
                write!(f, "Unknown credit package: {}", package)
            }
            Self::InsufficientCredits { needed, available } => {
                write!(f, "Insufficient credits: need {}, have {}", needed, available)
            }
            Self::ProviderTimeout { operation } => {
                write!(f, "Provider call '{}' timed out", operation)
            }
            Self::Provider {
                operation,
                message,
                http_status,
            } => {
                write!(f, "Provider error during '{}': {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::PersistenceConflict { detail } => {
                write!(f, "Storage conflict, retry: {}", detail)
            }
            Self::Internal { message } => {
                write!(f, "Internal payment error: {}", message)
            }
        }
    }
}

impl std::error::Error for PaymentError {}

impl From<PaymentError> for crate::error::TollgateError {
    fn from(err: PaymentError) -> Self {
        match &err {
            // Rejected for good: the provider retrying the same request
            // cannot help, so these map to 4xx.
            PaymentError::VerificationFailed { .. } => {
                crate::error::TollgateError::Unauthorized(err.to_string())
            }
            PaymentError::StaleTimestamp { .. }
            | PaymentError::MalformedPayload { .. }
            | PaymentError::SessionMismatch { .. }
            | PaymentError::UnknownPackage { .. } => {
                crate::error::TollgateError::BadRequest(err.to_string())
            }
            PaymentError::UnknownSession { .. } => {
                crate::error::TollgateError::NotFound(err.to_string())
            }

            PaymentError::InsufficientCredits { .. } => {
                crate::error::TollgateError::PaymentRequired(err.to_string())
            }

            // Transient: 5xx so webhook providers redeliver.
            PaymentError::ProviderTimeout { .. } => crate::error::TollgateError::RequestTimeout,
            PaymentError::PersistenceConflict { .. } => {
                crate::error::TollgateError::ServiceUnavailable(err.to_string())
            }

            PaymentError::Provider { http_status, .. } => match http_status {
                Some(400..=499) => crate::error::TollgateError::BadRequest(err.to_string()),
                _ => crate::error::TollgateError::ServiceUnavailable(err.to_string()),
            },

            PaymentError::Internal { .. } => {
                crate::error::TollgateError::Internal(err.to_string())
            }
        }
    }
}

impl PaymentError {
    /// Check if this is a client-side (non-retryable) rejection.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::VerificationFailed { .. }
                | Self::StaleTimestamp { .. }
                | Self::MalformedPayload { .. }
                | Self::SessionMismatch { .. }
                | Self::UnknownSession { .. }
                | Self::UnknownPackage { .. }
                | Self::InsufficientCredits { .. }
        )
    }

    /// Check if a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderTimeout { .. } | Self::PersistenceConflict { .. } => true,
            Self::Provider { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599) | None)
            }
            _ => false,
        }
    }
}
