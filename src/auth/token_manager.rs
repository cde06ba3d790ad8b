use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::auth::{codewhisperer, gemini, jwt};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::store::{Account, AccountKind, AccountStore};

/// Refresh when fewer than this many seconds of validity remain.
const EXPIRY_LEEWAY_SECS: i64 = 60;
/// Assumed lifetime when neither expires_in nor a JWT exp is available.
const FALLBACK_TTL_SECS: i64 = 3500;
/// Synthetic account id for the env-credential fallback mode.
pub const FALLBACK_ACCOUNT_ID: &str = "env-codewhisperer";

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
    cached_at: i64,
    last_used: i64,
    error_count: u32,
}

/// Per-account token lifecycle: cache until expiry, refresh on demand,
/// coalesce concurrent refreshes behind a per-account mutex.
pub struct TokenManager {
    store: AccountStore,
    config: Arc<GatewayConfig>,
    http: reqwest::Client,
    cache: DashMap<String, CachedToken>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenManager {
    pub fn new(store: AccountStore, config: Arc<GatewayConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            store,
            config,
            http,
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cached_valid(&self, account_id: &str) -> Option<String> {
        let now = chrono::Utc::now().timestamp();
        let mut entry = self.cache.get_mut(account_id)?;
        if entry.expires_at > now + EXPIRY_LEEWAY_SECS {
            entry.last_used = now;
            return Some(entry.access_token.clone());
        }
        None
    }

    fn cache_token(&self, account_id: &str, access_token: &str, expires_at: i64) {
        let now = chrono::Utc::now().timestamp();
        self.cache.insert(
            account_id.to_string(),
            CachedToken {
                access_token: access_token.to_string(),
                expires_at,
                cached_at: now,
                last_used: now,
                error_count: 0,
            },
        );
    }

    /// Return a bearer token for the account, refreshing when the cached or
    /// persisted token is absent or expires within the leeway window.
    pub async fn get_token(&self, account: &Account) -> GatewayResult<String> {
        if let Some(token) = self.cached_valid(&account.id) {
            return Ok(token);
        }

        // A persisted token survives restarts; trust it while its JWT exp
        // holds. Opaque (non-JWT) tokens fall through to a refresh.
        if let Some(stored) = &account.access_token {
            if jwt::is_valid(stored, EXPIRY_LEEWAY_SECS) {
                let expires_at = jwt::expiry(stored)
                    .unwrap_or_else(|| chrono::Utc::now().timestamp() + FALLBACK_TTL_SECS);
                self.cache_token(&account.id, stored, expires_at);
                return Ok(stored.clone());
            }
        }

        let lock = self.lock_for(&account.id);
        let _guard = lock.lock().await;

        // Someone else may have refreshed while we waited.
        if let Some(token) = self.cached_valid(&account.id) {
            return Ok(token);
        }

        self.refresh(account).await
    }

    /// Refresh regardless of cache state; used on mid-request 401/403.
    pub async fn force_refresh(&self, account: &Account) -> GatewayResult<String> {
        let lock = self.lock_for(&account.id);
        let _guard = lock.lock().await;
        self.refresh(account).await
    }

    pub async fn auth_headers(&self, account: &Account) -> GatewayResult<(String, String)> {
        let token = self.get_token(account).await?;
        Ok(("Authorization".to_string(), format!("Bearer {}", token)))
    }

    /// Record an upstream failure against the cached entry and drop it so
    /// the next call re-validates from scratch.
    pub fn mark_token_error(&self, account_id: &str) {
        if let Some(mut entry) = self.cache.get_mut(account_id) {
            entry.error_count += 1;
        }
        self.cache.remove(account_id);
    }

    pub fn invalidate(&self, account_id: &str) {
        self.cache.remove(account_id);
    }

    async fn refresh(&self, account: &Account) -> GatewayResult<String> {
        let Some(refresh_token) = account.refresh_token.as_deref().filter(|s| !s.is_empty())
        else {
            let _ = self
                .store
                .update_refresh_status(&account.id, "failed_missing_credentials");
            return Err(GatewayError::TokenRefresh(format!(
                "account {} lacks refresh credentials",
                account.id
            )));
        };

        tracing::info!("Refreshing access token for account {}", account.id);

        match account.kind {
            AccountKind::Codewhisperer => {
                let result = codewhisperer::refresh_token(
                    &self.http,
                    &self.config.codewhisperer_token_endpoint,
                    &account.client_id,
                    &account.client_secret,
                    refresh_token,
                )
                .await;

                match result {
                    Ok(token) => {
                        let expires_at = token
                            .expires_in
                            .map(|ttl| chrono::Utc::now().timestamp() + ttl)
                            .or_else(|| jwt::expiry(&token.access_token))
                            .unwrap_or_else(|| {
                                chrono::Utc::now().timestamp() + FALLBACK_TTL_SECS
                            });

                        let _ = self.store.update_tokens(
                            &account.id,
                            &token.access_token,
                            token.refresh_token.as_deref(),
                            "success",
                        )?;
                        self.cache_token(&account.id, &token.access_token, expires_at);
                        tracing::info!("Token refresh succeeded for account {}", account.id);
                        Ok(token.access_token)
                    }
                    Err(failure) => {
                        let _ = self
                            .store
                            .update_refresh_status(&account.id, &failure.status_label());
                        tracing::error!(
                            "Token refresh failed for account {}: {}",
                            account.id,
                            failure
                        );
                        Err(GatewayError::TokenRefresh(failure.to_string()))
                    }
                }
            }
            AccountKind::Gemini => {
                let result = gemini::refresh_token(
                    &self.http,
                    &account.client_id,
                    &account.client_secret,
                    refresh_token,
                )
                .await;

                match result {
                    Ok(token) => {
                        let expires_at = chrono::Utc::now().timestamp()
                            + token.expires_in.unwrap_or(FALLBACK_TTL_SECS);

                        let _ = self.store.update_tokens(
                            &account.id,
                            &token.access_token,
                            token.refresh_token.as_deref(),
                            "success",
                        )?;
                        self.cache_token(&account.id, &token.access_token, expires_at);
                        tracing::info!("Token refresh succeeded for account {}", account.id);
                        Ok(token.access_token)
                    }
                    Err(failure) => {
                        let _ = self
                            .store
                            .update_refresh_status(&account.id, &failure.status_label());
                        tracing::error!(
                            "Token refresh failed for account {}: {}",
                            account.id,
                            failure
                        );
                        Err(GatewayError::TokenRefresh(failure.to_string()))
                    }
                }
            }
        }
    }

    /// Synthetic account backed by env credentials, used when the store has
    /// no enabled CodeWhisperer accounts. Tokens live in the cache only.
    pub fn fallback_account(config: &GatewayConfig) -> Account {
        Account {
            id: FALLBACK_ACCOUNT_ID.to_string(),
            label: Some("env-fallback".to_string()),
            kind: AccountKind::Codewhisperer,
            enabled: true,
            client_id: config.fallback.client_id.clone(),
            client_secret: config.fallback.client_secret.clone(),
            refresh_token: Some(config.fallback.refresh_token.clone()),
            access_token: None,
            other: serde_json::json!({}),
            last_refresh_time: None,
            last_refresh_status: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}
