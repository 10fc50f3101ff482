//! API error types for the Rivet and redirect servers.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::RngCore;
use silo_proxy::ProxyError;

/// API error type. Every variant maps to a status code and a JSON body of
/// the form `{"error": message}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Not found")]
    NotFound,

    #[error("Length required")]
    LengthRequired,

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Content-Type must be {0}")]
    UnsupportedMediaType(String),

    #[error("Currently in read-only maintenance mode; try again later")]
    ReadOnly,

    #[error("Upstream error {0}")]
    UpstreamStatus(u16),

    #[error("Upstream refused connection")]
    UpstreamRefused,

    #[error("Upstream timeout")]
    UpstreamTimeout,

    #[error("Internal error {0}")]
    Internal(String),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ReadOnly => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamStatus(_) | Self::UpstreamRefused => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wrap an unexpected error behind an opaque correlation token.
    ///
    /// The full detail goes to the operator-facing log only; the caller
    /// sees nothing but `Internal error <token>`.
    pub fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        let mut token_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);
        tracing::error!(token = %token, error = %err, context, "internal error");
        Self::Internal(token)
    }

    /// Map a proxy-layer error onto the API taxonomy.
    pub fn from_proxy(err: ProxyError, context: &str) -> Self {
        if err.is_not_found() {
            return Self::NotFound;
        }
        match err {
            ProxyError::ReadOnly => Self::ReadOnly,
            ProxyError::InvalidRequest(msg) => Self::BadRequest(msg),
            other => Self::internal(other, context),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        let mut response = (status, Json(body)).into_response();
        if let Self::UnsupportedMediaType(expected) = &self {
            if let Ok(value) = header::HeaderValue::from_str(expected) {
                response.headers_mut().insert(header::ACCEPT, value);
            }
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::ReadOnly.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::UpstreamStatus(500).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_internal_token_is_opaque() {
        let err = ApiError::internal("secret database detail", "test");
        let msg = err.to_string();
        assert!(msg.starts_with("Internal error "));
        assert!(!msg.contains("database"));
        // 8 random bytes, hex encoded.
        assert_eq!(msg.trim_start_matches("Internal error ").len(), 16);
    }
}
