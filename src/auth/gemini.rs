use serde::Deserialize;
use serde_json::{json, Value};

use super::codewhisperer::RefreshFailure;
use crate::config::GOOGLE_TOKEN_ENDPOINT;

// Public installed-app client shared by all donated Gemini accounts.
pub const CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "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";

const USER_AGENT: &str = "antigravity/1.11.3 darwin/arm64";

#[derive(Debug, Deserialize)]
pub struct GeminiTokenResponse {
    pub access_token: String,
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Refresh an access token against the Google OAuth endpoint
/// (form-encoded, snake_case).
pub async fn refresh_token(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<GeminiTokenResponse, RefreshFailure> {
    let params = [
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(GOOGLE_TOKEN_ENDPOINT)
        .form(&params)
        .send()
        .await
        .map_err(|e| RefreshFailure::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RefreshFailure::Http(status.as_u16(), body));
    }

    response
        .json::<GeminiTokenResponse>()
        .await
        .map_err(|e| RefreshFailure::Network(format!("token parse failed: {}", e)))
}

/// Exchange an OAuth authorization code for tokens (callback ingestion).
pub async fn exchange_code(
    client: &reqwest::Client,
    code: &str,
    redirect_uri: &str,
) -> Result<GeminiTokenResponse, RefreshFailure> {
    let params = [
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("code", code),
        ("grant_type", "authorization_code"),
        ("redirect_uri", redirect_uri),
    ];

    let response = client
        .post(GOOGLE_TOKEN_ENDPOINT)
        .form(&params)
        .header("x-goog-api-client", "gl-node/22.18.0")
        .header("User-Agent", "google-api-nodejs-client/10.3.0")
        .send()
        .await
        .map_err(|e| RefreshFailure::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RefreshFailure::Http(status.as_u16(), body));
    }

    response
        .json::<GeminiTokenResponse>()
        .await
        .map_err(|e| RefreshFailure::Network(format!("token parse failed: {}", e)))
}

/// Discover the cloudaicompanion project backing an account.
pub async fn load_project_id(
    client: &reqwest::Client,
    api_endpoint: &str,
    access_token: &str,
) -> Result<String, String> {
    let url = format!("{}/v1internal:loadCodeAssist", api_endpoint);
    let body = json!({"metadata": {"ideType": "ANTIGRAVITY"}});

    let response = client
        .post(&url)
        .bearer_auth(access_token)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("loadCodeAssist request failed: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("loadCodeAssist failed: {} {}", status, text));
    }

    let data: Value = response
        .json()
        .await
        .map_err(|e| format!("loadCodeAssist parse failed: {}", e))?;

    data.get("cloudaicompanionProject")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| "response missing cloudaicompanionProject".to_string())
}

/// Live quota snapshot for all models visible to the account.
pub async fn fetch_available_models(
    client: &reqwest::Client,
    api_endpoint: &str,
    access_token: &str,
    project_id: &str,
) -> Result<Value, String> {
    let url = format!("{}/v1internal:fetchAvailableModels", api_endpoint);

    let response = client
        .post(&url)
        .bearer_auth(access_token)
        .header("Content-Type", "application/json")
        .header("User-Agent", USER_AGENT)
        .json(&json!({"project": project_id}))
        .send()
        .await
        .map_err(|e| format!("fetchAvailableModels request failed: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("fetchAvailableModels failed: {} {}", status, text));
    }

    response
        .json()
        .await
        .map_err(|e| format!("fetchAvailableModels parse failed: {}", e))
}

/// Condense a fetchAvailableModels payload into the persisted ledger shape.
pub fn extract_credits_info(models_data: &Value) -> Value {
    let mut models_out = serde_json::Map::new();
    let mut total_fraction = 0.0;
    let mut count = 0usize;

    if let Some(models) = models_data.get("models").and_then(|m| m.as_object()) {
        for (model_id, info) in models {
            let quota = info.get("quotaInfo");
            let fraction = quota
                .and_then(|q| q.get("remainingFraction"))
                .and_then(|v| v.as_f64());

            if let Some(fraction) = fraction {
                models_out.insert(
                    model_id.clone(),
                    json!({
                        "displayName": info.get("displayName").and_then(|v| v.as_str()).unwrap_or(model_id),
                        "remainingFraction": fraction,
                        "remainingPercent": (fraction * 100.0) as i64,
                        "resetTime": quota.and_then(|q| q.get("resetTime")).cloned().unwrap_or(Value::Null),
                        "recommended": info.get("recommended").and_then(|v| v.as_bool()).unwrap_or(false),
                    }),
                );
                total_fraction += fraction;
                count += 1;
            }
        }
    }

    json!({
        "models": models_out,
        "summary": {
            "totalModels": count,
            "averageRemaining": if count > 0 { total_fraction / count as f64 } else { 0.0 },
        }
    })
}

/// Quota details for one model out of a fetchAvailableModels payload.
pub fn extract_model_quota(models_data: &Value, model: &str) -> (f64, Option<String>) {
    let quota = models_data
        .get("models")
        .and_then(|m| m.get(model))
        .and_then(|info| info.get("quotaInfo"));

    let fraction = quota
        .and_then(|q| q.get("remainingFraction"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let reset_time = quota
        .and_then(|q| q.get("resetTime"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    (fraction, reset_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Value {
        json!({
            "models": {
                "claude-sonnet-4-5": {
                    "displayName": "Claude Sonnet 4.5",
                    "recommended": true,
                    "quotaInfo": {"remainingFraction": 0.81, "resetTime": "2025-11-20T16:18:40Z"}
                },
                "gemini-3-pro-high": {
                    "recommended": true,
                    "quotaInfo": {"remainingFraction": 0.21, "resetTime": "2025-11-20T16:12:51Z"}
                },
                "no-quota-model": {"displayName": "x"}
            }
        })
    }

    #[test]
    fn test_extract_credits_info() {
        let credits = extract_credits_info(&snapshot());
        assert_eq!(credits["summary"]["totalModels"], 2);
        let avg = credits["summary"]["averageRemaining"].as_f64().unwrap();
        assert!((avg - 0.51).abs() < 1e-9);

        let sonnet = &credits["models"]["claude-sonnet-4-5"];
        assert_eq!(sonnet["remainingPercent"], 81);
        assert_eq!(sonnet["resetTime"], "2025-11-20T16:18:40Z");
        assert_eq!(sonnet["recommended"], true);
        // Models without quotaInfo are not recorded.
        assert!(credits["models"].get("no-quota-model").is_none());
    }

    #[test]
    fn test_extract_model_quota() {
        let (fraction, reset) = extract_model_quota(&snapshot(), "gemini-3-pro-high");
        assert!((fraction - 0.21).abs() < 1e-9);
        assert_eq!(reset.as_deref(), Some("2025-11-20T16:12:51Z"));

        let (fraction, reset) = extract_model_quota(&snapshot(), "unknown-model");
        assert_eq!(fraction, 0.0);
        assert!(reset.is_none());
    }
}
