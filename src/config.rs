use std::env;

pub const DEFAULT_CODEWHISPERER_ENDPOINT: &str = "https://q.us-east-1.amazonaws.com/";
pub const DEFAULT_CODEWHISPERER_TOKEN_ENDPOINT: &str = "https://oidc.us-east-1.amazonaws.com/token";
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Env credentials for single-account CodeWhisperer fallback mode. Used only
/// when the store has no enabled CodeWhisperer accounts.
#[derive(Debug, Clone, Default)]
pub struct FallbackCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl FallbackCredentials {
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty()
            && !self.client_secret.is_empty()
            && !self.refresh_token.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen port.
    pub port: u16,
    /// Optional client shared secret; absent = open.
    pub api_key: Option<String>,
    /// Optional admin secret for the /v2 surface.
    pub admin_key: Option<String>,
    /// Base URL used to assemble OAuth redirect URIs.
    pub base_url: Option<String>,
    /// CodeWhisperer streaming endpoint.
    pub codewhisperer_endpoint: String,
    /// AWS SSO OIDC token endpoint.
    pub codewhisperer_token_endpoint: String,
    /// Organization profile ARN, forwarded when non-empty.
    pub profile_arn: Option<String>,
    /// Default Gemini Cloud Assist endpoint (per-account override in `other.api_endpoint`).
    pub gemini_endpoint: String,
    /// Keywords that force input_tokens to 0 when matched as whole words.
    pub zero_input_token_models: Vec<String>,
    pub fallback: FallbackCredentials,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let zero_models = env::var("ZERO_INPUT_TOKEN_MODELS").unwrap_or_else(|_| "haiku".into());

        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            api_key: env::var("API_KEY").ok().filter(|s| !s.is_empty()),
            admin_key: env::var("ADMIN_KEY").ok().filter(|s| !s.is_empty()),
            base_url: env::var("BASE_URL")
                .ok()
                .map(|s| s.trim_end_matches('/').to_string()),
            codewhisperer_endpoint: env::var("AMAZONQ_API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_CODEWHISPERER_ENDPOINT.into()),
            codewhisperer_token_endpoint: env::var("AMAZONQ_TOKEN_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_CODEWHISPERER_TOKEN_ENDPOINT.into()),
            profile_arn: env::var("AMAZONQ_PROFILE_ARN").ok().filter(|s| !s.is_empty()),
            gemini_endpoint: env::var("GEMINI_API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GEMINI_ENDPOINT.into()),
            zero_input_token_models: zero_models
                .split(',')
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            fallback: FallbackCredentials {
                client_id: env::var("AMAZONQ_CLIENT_ID").unwrap_or_default(),
                client_secret: env::var("AMAZONQ_CLIENT_SECRET").unwrap_or_default(),
                refresh_token: env::var("AMAZONQ_REFRESH_TOKEN").unwrap_or_default(),
            },
        }
    }

    /// Base URL for OAuth redirects, falling back to localhost on the listen port.
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: None,
            admin_key: None,
            base_url: None,
            codewhisperer_endpoint: DEFAULT_CODEWHISPERER_ENDPOINT.into(),
            codewhisperer_token_endpoint: DEFAULT_CODEWHISPERER_TOKEN_ENDPOINT.into(),
            profile_arn: None,
            gemini_endpoint: DEFAULT_GEMINI_ENDPOINT.into(),
            zero_input_token_models: vec!["haiku".into()],
            fallback: FallbackCredentials::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.zero_input_token_models, vec!["haiku".to_string()]);
        assert!(config.api_key.is_none());
        assert_eq!(config.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_fallback_completeness() {
        let mut fb = FallbackCredentials::default();
        assert!(!fb.is_complete());
        fb.client_id = "id".into();
        fb.client_secret = "secret".into();
        fb.refresh_token = "rt".into();
        assert!(fb.is_complete());
    }
}
