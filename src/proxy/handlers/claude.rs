// Claude-dialect chat endpoint and the CodeWhisperer request flow.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::seq::SliceRandom;
use serde_json::Value;

use crate::auth::token_manager::TokenManager;
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::common::tokens::{estimate_input_tokens, is_zero_input_token_model};
use crate::proxy::handlers::{self, forced_account, sse_response};
use crate::proxy::mappers::claude::models::ClaudeRequest;
use crate::proxy::mappers::codewhisperer::{self, Dialect};
use crate::proxy::mappers::sink::{ClaudeSseSink, EventSink};
use crate::proxy::mappers::translator::ResponseTranslator;
use crate::proxy::middleware::require_api_key;
use crate::proxy::parsers::event_stream::EventStreamParser;
use crate::proxy::server::AppState;
use crate::router;
use crate::store::{Account, AccountKind};

const SUSPENSION_MARKER: &str = "TEMPORARILY_SUSPENDED";

/// POST /v1/messages — Claude dialect, channel-routed, always SSE.
pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ClaudeRequest>,
) -> Response {
    if let Err(e) = require_api_key(&state.config, &headers) {
        return e.into_response();
    }

    tracing::info!("Claude request for model {}", request.model);

    let forced = match forced_account(&state, &headers) {
        Ok(forced) => forced,
        Err(e) => return e.into_response(),
    };

    // A forced account pins its own channel; otherwise route by model.
    let channel = match &forced {
        Some(account) => account.kind,
        None => {
            let (cw, gemini) = match handlers::channel_counts(&state) {
                Ok(counts) => counts,
                Err(e) => return e.into_response(),
            };
            match router::route_channel(&request.model, cw, gemini, &mut rand::thread_rng()) {
                Some(channel) => channel,
                None => {
                    return GatewayError::NoAccountAvailable(format!(
                        "no enabled account can serve {}",
                        request.model
                    ))
                    .into_response()
                }
            }
        }
    };

    let result = match channel {
        AccountKind::Codewhisperer => {
            stream_codewhisperer(&state, &request, Dialect::Claude, Box::new(ClaudeSseSink), forced)
                .await
        }
        AccountKind::Gemini => {
            super::gemini::stream_gemini(&state, &request, Box::new(ClaudeSseSink), forced, false)
                .await
        }
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Run the CodeWhisperer flow and return the translated SSE response.
pub(crate) async fn stream_codewhisperer(
    state: &AppState,
    request: &ClaudeRequest,
    dialect: Dialect,
    sink: Box<dyn EventSink>,
    forced: Option<Account>,
) -> GatewayResult<Response> {
    let body = codewhisperer::transform_claude_request(
        request,
        state.config.profile_arn.as_deref(),
        dialect,
    )?;

    let (upstream, _account) = open_codewhisperer_stream(state, &body, forced).await?;

    let input_tokens =
        if is_zero_input_token_model(&request.model, &state.config.zero_input_token_models) {
            0
        } else {
            estimate_input_tokens(request)
        };

    let translator = ResponseTranslator::new(sink, &request.model, input_tokens)
        .with_bracket_rescue(dialect == Dialect::OpenAi);
    Ok(sse_response(upstream, EventStreamParser::new(), translator))
}

/// Open the streaming POST, rotating through eligible accounts on failure.
/// Returns an open 200 response; every error path has already recorded its
/// side effects (token error, suspension) before surfacing.
pub(crate) async fn open_codewhisperer_stream(
    state: &AppState,
    body: &Value,
    forced: Option<Account>,
) -> GatewayResult<(reqwest::Response, Account)> {
    let accounts = match forced {
        Some(account) => vec![account],
        None => {
            let mut list = state.store.list_enabled(Some(AccountKind::Codewhisperer))?;
            if list.is_empty() {
                if state.config.fallback.is_complete() {
                    tracing::info!("No stored accounts, using env-credential fallback");
                    list.push(TokenManager::fallback_account(&state.config));
                } else {
                    return Err(GatewayError::NoAccountAvailable(
                        "no enabled codewhisperer accounts".to_string(),
                    ));
                }
            }
            list.shuffle(&mut rand::thread_rng());
            list
        }
    };

    let max_attempts = accounts.len();
    let mut last_error =
        GatewayError::UpstreamUnavailable("no upstream attempt was made".to_string());

    for (attempt, account) in accounts.into_iter().enumerate() {
        tracing::info!(
            "CodeWhisperer attempt {}/{} using account {}",
            attempt + 1,
            max_attempts,
            account.id
        );

        let token = match state.tokens.get_token(&account).await {
            Ok(token) => token,
            Err(e) => {
                last_error = e;
                continue;
            }
        };

        let response = match state
            .upstream
            .send_codewhisperer(&state.config.codewhisperer_endpoint, &token, body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                state.tokens.mark_token_error(&account.id);
                last_error = e;
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok((response, account));
        }

        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!(
            "CodeWhisperer upstream {} on attempt {}/{}: {:.200}",
            status,
            attempt + 1,
            max_attempts,
            error_text
        );

        if status.as_u16() == 401 || status.as_u16() == 403 {
            if error_text.contains(SUSPENSION_MARKER) {
                state.store.set_suspended(&account.id, SUSPENSION_MARKER)?;
                return Err(GatewayError::AccountSuspended(format!(
                    "account {} suspended by provider",
                    account.id
                )));
            }

            // Stale token: refresh once and retry the same account.
            match state.tokens.force_refresh(&account).await {
                Ok(new_token) => {
                    let retry = state
                        .upstream
                        .send_codewhisperer(&state.config.codewhisperer_endpoint, &new_token, body)
                        .await;
                    match retry {
                        Ok(retry_response) if retry_response.status().is_success() => {
                            return Ok((retry_response, account));
                        }
                        Ok(retry_response) => {
                            let retry_status = retry_response.status();
                            let retry_text = retry_response.text().await.unwrap_or_default();
                            if retry_text.contains(SUSPENSION_MARKER) {
                                state.store.set_suspended(&account.id, SUSPENSION_MARKER)?;
                                return Err(GatewayError::AccountSuspended(format!(
                                    "account {} suspended by provider",
                                    account.id
                                )));
                            }
                            state.tokens.mark_token_error(&account.id);
                            last_error = GatewayError::UpstreamUnavailable(format!(
                                "HTTP {} after token refresh: {:.200}",
                                retry_status, retry_text
                            ));
                        }
                        Err(e) => {
                            state.tokens.mark_token_error(&account.id);
                            last_error = e;
                        }
                    }
                }
                Err(e) => {
                    state.tokens.mark_token_error(&account.id);
                    last_error = e;
                }
            }
            continue;
        }

        if status.as_u16() == 429 {
            state.tokens.mark_token_error(&account.id);
            last_error = GatewayError::RateLimited(format!("upstream 429: {:.200}", error_text));
            continue;
        }

        state.tokens.mark_token_error(&account.id);
        last_error =
            GatewayError::UpstreamUnavailable(format!("HTTP {}: {:.200}", status, error_text));
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::store::AccountStore;
    use std::sync::Arc;

    fn empty_state() -> AppState {
        let store = AccountStore::open_in_memory().unwrap();
        let config = Arc::new(GatewayConfig::default());
        AppState::new(config, store)
    }

    #[tokio::test]
    async fn test_no_accounts_and_no_fallback_is_503() {
        let state = empty_state();
        let err = open_codewhisperer_stream(&state, &serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAccountAvailable(_)));
    }
}
