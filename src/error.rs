use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Account suspended: {0}")]
    AccountSuspended(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("No account available: {0}")]
    NoAccountAvailable(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) | GatewayError::AccountSuspended(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::TokenRefresh(_)
            | GatewayError::UpstreamUnavailable(_)
            | GatewayError::Network(_) => StatusCode::BAD_GATEWAY,
            GatewayError::NoAccountAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Translation(_) | GatewayError::Database(_) | GatewayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Claude-style error type label for the JSON body.
    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Unauthorized(_) => "authentication_error",
            GatewayError::Forbidden(_) | GatewayError::AccountSuspended(_) => "permission_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::RateLimited(_) => "rate_limit_error",
            GatewayError::NoAccountAvailable(_) => "overloaded_error",
            _ => "api_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::NoAccountAvailable("empty".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::TokenRefresh("401".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::RateLimited("slow down".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::AccountSuspended("banned".into()).status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_error_type_labels() {
        assert_eq!(
            GatewayError::RateLimited("x".into()).error_type(),
            "rate_limit_error"
        );
        assert_eq!(
            GatewayError::NoAccountAvailable("x".into()).error_type(),
            "overloaded_error"
        );
    }
}
