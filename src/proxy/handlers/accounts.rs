// Admin and utility surface: account CRUD, token refresh, quota
// inspection, OAuth-callback ingestion.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::gemini as gemini_auth;
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::middleware::require_admin_key;
use crate::proxy::server::AppState;
use crate::store::{Account, AccountKind, AccountPatch, NewAccount};

pub async fn handle_root() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "qgate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: healthy iff at least one enabled account exists.
pub async fn handle_health(State(state): State<AppState>) -> Response {
    match state.store.list_all() {
        Ok(accounts) => {
            let enabled = accounts.iter().filter(|a| a.enabled).count();
            if enabled == 0 && !state.config.fallback.is_complete() {
                Json(json!({
                    "status": "unhealthy",
                    "reason": "no_enabled_accounts",
                    "enabled_accounts": 0,
                    "total_accounts": accounts.len(),
                }))
                .into_response()
            } else {
                Json(json!({
                    "status": "healthy",
                    "enabled_accounts": enabled,
                    "total_accounts": accounts.len(),
                }))
                .into_response()
            }
        }
        Err(e) => Json(json!({
            "status": "unhealthy",
            "reason": "system_error",
            "error": e.to_string(),
        }))
        .into_response(),
    }
}

pub async fn list_accounts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin_key(&state.config, &headers) {
        return e.into_response();
    }
    match state.store.list_all() {
        Ok(accounts) => Json(accounts).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn create_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(attrs): Json<NewAccount>,
) -> Response {
    if let Err(e) = require_admin_key(&state.config, &headers) {
        return e.into_response();
    }
    match state.store.create(attrs) {
        Ok(account) => Json(account).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = require_admin_key(&state.config, &headers) {
        return e.into_response();
    }
    match state.store.get(&id) {
        Ok(Some(account)) => Json(account).into_response(),
        Ok(None) => GatewayError::NotFound(format!("account does not exist: {}", id)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn update_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<AccountPatch>,
) -> Response {
    if let Err(e) = require_admin_key(&state.config, &headers) {
        return e.into_response();
    }
    match state.store.update(&id, patch) {
        Ok(Some(account)) => Json(account).into_response(),
        Ok(None) => GatewayError::NotFound(format!("account does not exist: {}", id)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = require_admin_key(&state.config, &headers) {
        return e.into_response();
    }
    match state.store.delete(&id) {
        Ok(true) => Json(json!({"deleted": id})).into_response(),
        Ok(false) => {
            GatewayError::NotFound(format!("account does not exist: {}", id)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// POST /v2/accounts/{id}/refresh — force a token refresh regardless of
/// cache state.
pub async fn refresh_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = require_admin_key(&state.config, &headers) {
        return e.into_response();
    }

    let account = match state.store.get(&id) {
        Ok(Some(account)) => account,
        Ok(None) => {
            return GatewayError::NotFound(format!("account does not exist: {}", id))
                .into_response()
        }
        Err(e) => return e.into_response(),
    };

    match state.tokens.force_refresh(&account).await {
        Ok(_) => match state.store.get(&id) {
            Ok(Some(updated)) => Json(updated).into_response(),
            Ok(None) => GatewayError::NotFound(format!("account vanished: {}", id)).into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

/// GET /v2/accounts/{id}/quota — live snapshot; Gemini accounts only.
pub async fn account_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = require_admin_key(&state.config, &headers) {
        return e.into_response();
    }

    match fetch_quota_snapshot(&state, &id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn fetch_quota_snapshot(state: &AppState, id: &str) -> GatewayResult<Value> {
    let account = state
        .store
        .get(id)?
        .ok_or_else(|| GatewayError::NotFound(format!("account does not exist: {}", id)))?;

    if account.kind != AccountKind::Gemini {
        return Err(GatewayError::BadRequest(
            "quota inspection is only available for gemini accounts".to_string(),
        ));
    }

    let token = state.tokens.get_token(&account).await?;
    let endpoint = account.api_endpoint(&state.config.gemini_endpoint);
    let project = match account.project_id() {
        Some(project) => project,
        None => gemini_auth::load_project_id(state.upstream.control_client(), &endpoint, &token)
            .await
            .map_err(GatewayError::UpstreamUnavailable)?,
    };

    gemini_auth::fetch_available_models(state.upstream.control_client(), &endpoint, &token, &project)
        .await
        .map_err(GatewayError::UpstreamUnavailable)
}

/// GET /api/gemini/accounts — aggregated per-model quota across the pool.
pub async fn gemini_account_stats(State(state): State<AppState>) -> Response {
    let accounts = match state.store.list_enabled(Some(AccountKind::Gemini)) {
        Ok(accounts) => accounts,
        Err(e) => return e.into_response(),
    };

    let mut account_views: Vec<Value> = Vec::new();
    let mut model_totals: serde_json::Map<String, Value> = serde_json::Map::new();

    for account in &accounts {
        // Live refresh per account; stored ledger data on failure.
        let credits = match refresh_account_credits(&state, account).await {
            Ok(credits) => credits,
            Err(e) => {
                tracing::warn!("Quota refresh failed for account {}: {}", account.id, e);
                account
                    .other
                    .get("creditsInfo")
                    .cloned()
                    .unwrap_or_else(|| json!({"models": {}, "summary": {}}))
            }
        };

        if let Some(models) = credits.get("models").and_then(|m| m.as_object()) {
            for (model_id, info) in models {
                if !info.get("recommended").and_then(|r| r.as_bool()).unwrap_or(false) {
                    continue;
                }
                let fraction = info
                    .get("remainingFraction")
                    .and_then(|f| f.as_f64())
                    .unwrap_or(0.0);

                let entry = model_totals.entry(model_id.clone()).or_insert_with(|| {
                    json!({
                        "displayName": info.get("displayName").cloned().unwrap_or(json!(model_id)),
                        "totalRemaining": 0.0,
                        "accountCount": 0,
                    })
                });
                entry["totalRemaining"] =
                    json!(entry["totalRemaining"].as_f64().unwrap_or(0.0) + fraction);
                entry["accountCount"] = json!(entry["accountCount"].as_i64().unwrap_or(0) + 1);
            }
        }

        account_views.push(json!({
            "id": account.id,
            "label": account.label,
            "enabled": account.enabled,
            "creditsInfo": credits,
            "projectId": account.project_id(),
            "created_at": account.created_at,
        }));
    }

    for (_, entry) in model_totals.iter_mut() {
        let total = entry["totalRemaining"].as_f64().unwrap_or(0.0);
        let count = entry["accountCount"].as_i64().unwrap_or(0).max(1);
        entry["averagePercent"] = json!(((total / count as f64) * 100.0) as i64);
    }

    Json(json!({
        "modelTotals": model_totals,
        "activeCount": accounts.len(),
        "totalCount": accounts.len(),
        "accounts": account_views,
    }))
    .into_response()
}

async fn refresh_account_credits(state: &AppState, account: &Account) -> GatewayResult<Value> {
    let token = state.tokens.get_token(account).await?;
    let endpoint = account.api_endpoint(&state.config.gemini_endpoint);
    let project = account.project_id().ok_or_else(|| {
        GatewayError::BadRequest(format!("account {} has no project id", account.id))
    })?;

    let snapshot = gemini_auth::fetch_available_models(
        state.upstream.control_client(),
        &endpoint,
        &token,
        &project,
    )
    .await
    .map_err(GatewayError::UpstreamUnavailable)?;

    let credits = gemini_auth::extract_credits_info(&snapshot);
    state
        .store
        .merge_other(&account.id, json!({"creditsInfo": credits.clone()}))?;
    Ok(credits)
}

#[derive(Debug, Deserialize)]
pub struct OauthCallbackBody {
    pub code: Option<String>,
}

/// POST /api/gemini/oauth-callback — exchange an authorization code and
/// import the resulting account.
pub async fn gemini_oauth_callback(
    State(state): State<AppState>,
    Json(body): Json<OauthCallbackBody>,
) -> Response {
    let Some(code) = body.code.filter(|c| !c.is_empty()) else {
        return GatewayError::BadRequest("missing authorization code".to_string()).into_response();
    };

    match ingest_oauth_code(&state, &code).await {
        Ok(account) => Json(json!({
            "success": true,
            "message": "account added",
            "id": account.id,
            "label": account.label,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn ingest_oauth_code(state: &AppState, code: &str) -> GatewayResult<Account> {
    let http = state.upstream.control_client();
    let redirect_uri = format!("{}/api/gemini/oauth-callback", state.config.base_url());

    let tokens = gemini_auth::exchange_code(http, code, &redirect_uri)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("token exchange failed: {}", e)))?;

    let refresh_token = tokens
        .refresh_token
        .clone()
        .ok_or_else(|| GatewayError::BadRequest("no refresh_token in exchange response".into()))?;

    // Verify the account actually works before importing it.
    let endpoint = state.config.gemini_endpoint.clone();
    let project = gemini_auth::load_project_id(http, &endpoint, &tokens.access_token)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("account verification failed: {}", e)))?;

    let credits = match gemini_auth::fetch_available_models(
        http,
        &endpoint,
        &tokens.access_token,
        &project,
    )
    .await
    {
        Ok(snapshot) => gemini_auth::extract_credits_info(&snapshot),
        Err(e) => {
            tracing::warn!("Quota snapshot during import failed: {}", e);
            json!({"models": {}, "summary": {"totalModels": 0, "averageRemaining": 0}})
        }
    };

    let label = format!("Gemini-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
    let account = state.store.create(NewAccount {
        label: Some(label),
        client_id: gemini_auth::CLIENT_ID.to_string(),
        client_secret: gemini_auth::CLIENT_SECRET.to_string(),
        refresh_token: Some(refresh_token),
        access_token: Some(tokens.access_token.clone()),
        other: Some(json!({
            "project": project,
            "api_endpoint": endpoint,
            "creditsInfo": credits,
        })),
        enabled: Some(true),
        kind: Some(AccountKind::Gemini),
    })?;

    tracing::info!("Imported gemini account {}", account.id);
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::store::AccountStore;
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(
            Arc::new(GatewayConfig::default()),
            AccountStore::open_in_memory().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_health_unhealthy_without_accounts() {
        let response = handle_health(State(state())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_key_enforced() {
        let mut config = GatewayConfig::default();
        config.admin_key = Some("topsecret".into());
        let state = AppState::new(Arc::new(config), AccountStore::open_in_memory().unwrap());

        let response = list_accounts(State(state), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let state = state();
        let headers = HeaderMap::new();

        let created = create_account(
            State(state.clone()),
            headers.clone(),
            Json(NewAccount {
                label: Some("x".into()),
                client_id: "c".into(),
                client_secret: "s".into(),
                kind: Some(AccountKind::Gemini),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);

        let listed = state.store.list_all().unwrap();
        assert_eq!(listed.len(), 1);
        let id = listed[0].id.clone();

        let got = get_account(State(state.clone()), headers.clone(), Path(id.clone())).await;
        assert_eq!(got.status(), StatusCode::OK);

        let missing =
            get_account(State(state.clone()), headers.clone(), Path("nope".into())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let deleted = delete_account(State(state.clone()), headers.clone(), Path(id)).await;
        assert_eq!(deleted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_quota_rejects_codewhisperer_accounts() {
        let state = state();
        let account = state
            .store
            .create(NewAccount {
                client_id: "c".into(),
                client_secret: "s".into(),
                kind: Some(AccountKind::Codewhisperer),
                ..Default::default()
            })
            .unwrap();

        let err = fetch_quota_snapshot(&state, &account.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_oauth_callback_requires_code() {
        let response = gemini_oauth_callback(
            State(state()),
            Json(OauthCallbackBody { code: None }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
