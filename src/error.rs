use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Errors raised by the quota engine.
///
/// Policy rejections are not errors; they travel as decisions carrying a
/// [`RejectReason`](crate::decision::RejectReason).
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Counter backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

impl QuotaError {
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, QuotaError::BackendUnavailable(_))
    }
}

impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        QuotaError::BackendUnavailable(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    /// Caller-facing body. Only scope and request validation failures carry
    /// their detail; everything else stays in the logs.
    pub fn from_quota_error(err: &QuotaError) -> Self {
        match err {
            QuotaError::InvalidScope(msg) => Self::new("invalid_scope", msg, 400),
            QuotaError::Validation(msg) => Self::new("validation_error", msg, 422),
            QuotaError::BackendUnavailable(_) => {
                Self::new("service_unavailable", "Usage service temporarily unavailable", 503)
            }
            QuotaError::Configuration(_) | QuotaError::Internal(_) => {
                Self::new("internal_error", "Internal server error", 500)
            }
        }
    }
}

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_quota_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = QuotaError::Configuration("no policy for tier 'gold'".to_string());
        let body = ErrorResponse::from_quota_error(&err);
        assert_eq!(body.code, 500);
        assert!(!body.message.contains("gold"));
    }

    #[test]
    fn test_invalid_scope_is_bad_request() {
        let body = ErrorResponse::from_quota_error(&QuotaError::InvalidScope("empty".into()));
        assert_eq!(body.code, 400);
        assert_eq!(body.error, "invalid_scope");
    }

    #[test]
    fn test_redis_error_maps_to_backend_unavailable() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        let err: QuotaError = redis_err.into();
        assert!(err.is_backend_unavailable());
    }
}
