use axum::http::HeaderMap;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

/// Client shared-secret check for the chat surface. No configured key
/// means the surface is open.
pub fn require_api_key(config: &GatewayConfig, headers: &HeaderMap) -> GatewayResult<()> {
    let Some(expected) = &config.api_key else {
        return Ok(());
    };

    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match provided {
        Some(key) if key == expected => Ok(()),
        _ => Err(GatewayError::Unauthorized(
            "valid x-api-key header required".to_string(),
        )),
    }
}

/// Admin-secret check for the /v2 account surface.
pub fn require_admin_key(config: &GatewayConfig, headers: &HeaderMap) -> GatewayResult<()> {
    let Some(expected) = &config.admin_key else {
        return Ok(());
    };

    match headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        Some(key) if key == expected => Ok(()),
        _ => Err(GatewayError::Forbidden(
            "valid X-Admin-Key header required".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with(api_key: Option<&str>, admin_key: Option<&str>) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.api_key = api_key.map(|s| s.to_string());
        config.admin_key = admin_key.map(|s| s.to_string());
        config
    }

    #[test]
    fn test_open_when_no_key_configured() {
        let config = config_with(None, None);
        let headers = HeaderMap::new();
        assert!(require_api_key(&config, &headers).is_ok());
        assert!(require_admin_key(&config, &headers).is_ok());
    }

    #[test]
    fn test_api_key_via_header_or_bearer() {
        let config = config_with(Some("sk-secret"), None);

        let mut headers = HeaderMap::new();
        assert!(require_api_key(&config, &headers).is_err());

        headers.insert("x-api-key", HeaderValue::from_static("sk-secret"));
        assert!(require_api_key(&config, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-secret"));
        assert!(require_api_key(&config, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert!(matches!(
            require_api_key(&config, &headers),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_admin_key() {
        let config = config_with(None, Some("admin-1"));

        let mut headers = HeaderMap::new();
        assert!(matches!(
            require_admin_key(&config, &headers),
            Err(GatewayError::Forbidden(_))
        ));

        headers.insert("x-admin-key", HeaderValue::from_static("admin-1"));
        assert!(require_admin_key(&config, &headers).is_ok());
    }
}
