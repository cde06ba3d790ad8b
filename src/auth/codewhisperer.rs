use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Refresh failure split by origin so the caller can stamp
/// `failed_network` vs `failed_<status>` on the account row.
#[derive(Debug)]
pub enum RefreshFailure {
    Network(String),
    Http(u16, String),
}

impl RefreshFailure {
    pub fn status_label(&self) -> String {
        match self {
            RefreshFailure::Network(_) => "failed_network".to_string(),
            RefreshFailure::Http(status, _) => format!("failed_{}", status),
        }
    }
}

impl std::fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshFailure::Network(e) => write!(f, "network error: {}", e),
            RefreshFailure::Http(status, body) => write!(f, "HTTP {}: {}", status, body),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CodewhispererTokenResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    pub expires_in: Option<i64>,
}

/// Refresh an access token against the AWS SSO OIDC endpoint.
///
/// The endpoint speaks JSON with camelCase keys and expects the AWS SDK
/// user-agent family; responses may rotate the refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<CodewhispererTokenResponse, RefreshFailure> {
    let payload = json!({
        "grantType": "refresh_token",
        "refreshToken": refresh_token,
        "clientId": client_id,
        "clientSecret": client_secret,
    });

    let response = client
        .post(token_endpoint)
        .header("Content-Type", "application/json")
        .header("User-Agent", "aws-sdk-rust/1.3.9 os/macos lang/rust/1.87.0")
        .header(
            "X-Amz-User-Agent",
            "aws-sdk-rust/1.3.9 ua/2.1 api/ssooidc/1.88.0 os/macos lang/rust/1.87.0 m/E app/AmazonQ-For-CLI",
        )
        .header("Amz-Sdk-Request", "attempt=1; max=3")
        .header("Amz-Sdk-Invocation-Id", Uuid::new_v4().to_string())
        .header("Accept", "*/*")
        .json(&payload)
        .send()
        .await
        .map_err(|e| RefreshFailure::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RefreshFailure::Http(status.as_u16(), body));
    }

    let token: CodewhispererTokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshFailure::Network(format!("token parse failed: {}", e)))?;

    if token.access_token.is_empty() {
        return Err(RefreshFailure::Network(
            "response missing accessToken".to_string(),
        ));
    }

    Ok(token)
}
