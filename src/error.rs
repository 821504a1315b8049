use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for the tollgate engine
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(String),
}

/// Standard error response format for API errors.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_id: Option<String>,
}

impl TollgateError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn payment_required(msg: impl Into<String>) -> Self {
        Self::PaymentRequired(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn request_timeout() -> Self {
        Self::RequestTimeout
    }

    pub fn too_many_requests(msg: impl Into<String>) -> Self {
        Self::TooManyRequests(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            #[cfg(feature = "postgres")]
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Returns a safe error message suitable for client responses.
    ///
    /// Client errors (4xx) expose their message since the caller needs to
    /// know what went wrong. Server errors (5xx) return a generic message so
    /// provider credentials, connection strings, and similar internals never
    /// reach end users; the full error is logged server-side.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::PaymentRequired(msg) => format!("Payment required: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),
            Self::TooManyRequests(msg) => format!("Too many requests: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),

            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),

            #[cfg(feature = "postgres")]
            Self::Database(_) => "Database error".to_string(),
        }
    }
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        // Full error detail goes to the server log, never to the client.
        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id: Some(error_id),
        });

        (status, body).into_response()
    }
}

/// Result type alias for tollgate operations
pub type Result<T> = std::result::Result<T, TollgateError>;

// Common error type conversions

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TollgateError::BadRequest(format!("JSON error: {}", err))
        } else {
            TollgateError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<reqwest::Error> for TollgateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TollgateError::RequestTimeout
        } else if err.is_connect() {
            TollgateError::ServiceUnavailable(format!("Connection error: {}", err))
        } else if err.is_status() {
            match err.status().map(|s| s.as_u16()) {
                Some(401) => TollgateError::Unauthorized("Provider authentication failed".to_string()),
                Some(404) => TollgateError::NotFound("Provider resource not found".to_string()),
                Some(429) => TollgateError::TooManyRequests("Provider rate limit exceeded".to_string()),
                Some(503) => TollgateError::ServiceUnavailable("Provider unavailable".to_string()),
                _ => TollgateError::Internal(format!("Provider error: {}", err)),
            }
        } else {
            TollgateError::Internal(format!("Request error: {}", err))
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for TollgateError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => TollgateError::NotFound("Record not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                TollgateError::ServiceUnavailable("Database pool exhausted".to_string())
            }
            _ => TollgateError::Database(format!("Database error: {}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = TollgateError::not_found("Session not found");
        assert!(matches!(err, TollgateError::NotFound(_)));
        assert_eq!(err.to_string(), "Not found: Session not found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_payment_required_error() {
        let err = TollgateError::payment_required("Insufficient credits");
        assert!(matches!(err, TollgateError::PaymentRequired(_)));
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_request_timeout_error() {
        let err = TollgateError::request_timeout();
        assert_eq!(err.to_string(), "Request timeout");
        assert_eq!(err.status_code(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_anyhow_error_is_internal() {
        let err: TollgateError = anyhow::anyhow!("Something unexpected").into();
        assert!(matches!(err, TollgateError::Anyhow(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_safe_message_client_errors_exposed() {
        assert_eq!(
            TollgateError::bad_request("Invalid package").safe_message(),
            "Bad request: Invalid package"
        );
        assert_eq!(
            TollgateError::payment_required("2 credits needed").safe_message(),
            "Payment required: 2 credits needed"
        );
    }

    #[test]
    fn test_safe_message_server_errors_hidden() {
        assert_eq!(
            TollgateError::internal("db password is 'secret123'").safe_message(),
            "Internal server error"
        );
        assert_eq!(
            TollgateError::service_unavailable("gateway at 10.0.0.3 unreachable").safe_message(),
            "Service unavailable"
        );
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: TollgateError = result.unwrap_err().into();
        assert!(matches!(err, TollgateError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_into_response_hides_internal_details() {
        let err = TollgateError::internal("Sensitive: provider key sk_live_123");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
        assert!(json["error_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_into_response_payment_required() {
        let err = TollgateError::payment_required("Insufficient credits");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }
}
