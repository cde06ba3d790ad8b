// Force-Gemini chat endpoint and the Gemini request flow, including the
// 429 quota-ledger handling.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::auth::gemini as gemini_auth;
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::common::tokens::{estimate_input_tokens, is_zero_input_token_model};
use crate::proxy::handlers::{forced_account, sse_response};
use crate::proxy::mappers::claude::models::ClaudeRequest;
use crate::proxy::mappers::gemini;
use crate::proxy::mappers::sink::{ClaudeSseSink, EventSink};
use crate::proxy::mappers::translator::ResponseTranslator;
use crate::proxy::middleware::require_api_key;
use crate::proxy::parsers::sse::SseParser;
use crate::proxy::server::AppState;
use crate::router;
use crate::store::{Account, AccountKind};

const SUSPENSION_MARKER: &str = "TEMPORARILY_SUSPENDED";

/// 429s with more residual quota than this are rate limits (RPM/TPM), not
/// exhaustion; the account keeps serving the model.
const RATE_LIMIT_RESIDUAL_FRACTION: f64 = 0.03;

/// POST /v1/gemini/messages — Claude dialect, Gemini channel only.
pub async fn handle_gemini_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ClaudeRequest>,
) -> Response {
    if let Err(e) = require_api_key(&state.config, &headers) {
        return e.into_response();
    }

    tracing::info!("Gemini request for model {}", request.model);

    let forced = match forced_account(&state, &headers) {
        Ok(forced) => forced,
        Err(e) => return e.into_response(),
    };
    if let Some(account) = &forced {
        if account.kind != AccountKind::Gemini {
            return GatewayError::BadRequest(format!(
                "account is not a gemini account: {}",
                account.id
            ))
            .into_response();
        }
    }

    match stream_gemini(&state, &request, Box::new(ClaudeSseSink), forced, false).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Run the Gemini flow and return the translated SSE response.
/// `rescue_bracket_calls` is set on the OpenAI dialect, whose clients
/// expect legacy bracket-format calls surfaced as structured tool_calls.
pub(crate) async fn stream_gemini(
    state: &AppState,
    request: &ClaudeRequest,
    sink: Box<dyn EventSink>,
    forced: Option<Account>,
    rescue_bracket_calls: bool,
) -> GatewayResult<Response> {
    let (upstream, _account) = open_gemini_stream(state, request, forced, true).await?;

    let input_tokens =
        if is_zero_input_token_model(&request.model, &state.config.zero_input_token_models) {
            0
        } else {
            estimate_input_tokens(request)
        };

    let translator = ResponseTranslator::new(sink, &request.model, input_tokens)
        .with_bracket_rescue(rescue_bracket_calls);
    Ok(sse_response(upstream, SseParser::new(), translator))
}

/// Unary variant for the non-streaming OpenAI path: returns the unwrapped
/// generate response JSON.
pub(crate) async fn fetch_gemini_completion(
    state: &AppState,
    request: &ClaudeRequest,
    forced: Option<Account>,
) -> GatewayResult<Value> {
    let (upstream, _account) = open_gemini_stream(state, request, forced, false).await?;

    let raw: Value = upstream.json().await.map_err(GatewayError::Network)?;
    Ok(raw.get("response").cloned().unwrap_or(raw))
}

/// Resolve token + project for an account, persisting a freshly discovered
/// project id.
async fn prepare_account(
    state: &AppState,
    account: &Account,
) -> GatewayResult<(String, String, String)> {
    let token = state.tokens.get_token(account).await?;
    let endpoint = account.api_endpoint(&state.config.gemini_endpoint);

    let project = match account.project_id() {
        Some(project) => project,
        None => {
            let project = gemini_auth::load_project_id(
                state.upstream.control_client(),
                &endpoint,
                &token,
            )
            .await
            .map_err(GatewayError::UpstreamUnavailable)?;
            tracing::info!("Discovered project {} for account {}", project, account.id);
            state
                .store
                .merge_other(&account.id, json!({"project": project}))?;
            project
        }
    };

    Ok((token, project, endpoint))
}

/// Open the Gemini generate call, rotating accounts on failure and keeping
/// the quota ledger current. Ledger/suspension writes land before any
/// error becomes user-visible.
pub(crate) async fn open_gemini_stream(
    state: &AppState,
    request: &ClaudeRequest,
    forced: Option<Account>,
    stream: bool,
) -> GatewayResult<(reqwest::Response, Account)> {
    let gemini_model = gemini::map_model(&request.model);

    let accounts = match forced {
        Some(account) => vec![account],
        None => {
            let mut list =
                router::eligible_accounts(&state.store, AccountKind::Gemini, &gemini_model)?;
            if list.is_empty() {
                return Err(GatewayError::NoAccountAvailable(format!(
                    "no gemini account can serve {}",
                    gemini_model
                )));
            }
            use rand::seq::SliceRandom;
            list.shuffle(&mut rand::thread_rng());
            list
        }
    };

    let max_attempts = accounts.len();
    let mut last_error =
        GatewayError::UpstreamUnavailable("no upstream attempt was made".to_string());

    for (attempt, account) in accounts.into_iter().enumerate() {
        tracing::info!(
            "Gemini attempt {}/{} using account {}",
            attempt + 1,
            max_attempts,
            account.id
        );

        let (token, project, endpoint) = match prepare_account(state, &account).await {
            Ok(prepared) => prepared,
            Err(e) => {
                last_error = e;
                continue;
            }
        };

        let body = gemini::transform_claude_request(request, &project)?;

        let response = match state
            .upstream
            .send_gemini(&endpoint, &token, &body, stream)
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
            "Gemini upstream {} on attempt {}/{}: {:.200}",
            status,
            attempt + 1,
            max_attempts,
            error_text
        );

        match status.as_u16() {
            401 | 403 => {
                if error_text.contains(SUSPENSION_MARKER) {
                    state.store.set_suspended(&account.id, SUSPENSION_MARKER)?;
                    return Err(GatewayError::AccountSuspended(format!(
                        "account {} suspended by provider",
                        account.id
                    )));
                }

                match state.tokens.force_refresh(&account).await {
                    Ok(new_token) => {
                        let retry = state
                            .upstream
                            .send_gemini(&endpoint, &new_token, &body, stream)
                            .await;
                        match retry {
                            Ok(retry_response) if retry_response.status().is_success() => {
                                return Ok((retry_response, account));
                            }
                            Ok(retry_response) => {
                                let retry_status = retry_response.status();
                                state.tokens.mark_token_error(&account.id);
                                last_error = GatewayError::UpstreamUnavailable(format!(
                                    "HTTP {} after token refresh",
                                    retry_status
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
            }
            429 => {
                match handle_quota_exceeded(state, &account, &token, &project, &endpoint, &gemini_model)
                    .await
                {
                    QuotaVerdict::RateLimited { residual } => {
                        // Plenty of quota left: this was RPM/TPM pressure.
                        // The account is not demoted; the caller backs off.
                        return Err(GatewayError::RateLimited(format!(
                            "rate limited with {:.0}% of quota remaining for {}",
                            residual * 100.0,
                            gemini_model
                        )));
                    }
                    QuotaVerdict::Exhausted { reset_time } => {
                        last_error = GatewayError::RateLimited(format!(
                            "quota exhausted for {}, resets at {}",
                            gemini_model, reset_time
                        ));
                    }
                }
            }
            _ => {
                state.tokens.mark_token_error(&account.id);
                last_error = GatewayError::UpstreamUnavailable(format!(
                    "HTTP {}: {:.200}",
                    status, error_text
                ));
            }
        }
    }

    Err(last_error)
}

enum QuotaVerdict {
    RateLimited { residual: f64 },
    Exhausted { reset_time: String },
}

/// 429 aftermath: refresh the ledger from a live snapshot and decide
/// whether this was throttling or true exhaustion.
async fn handle_quota_exceeded(
    state: &AppState,
    account: &Account,
    token: &str,
    project: &str,
    endpoint: &str,
    gemini_model: &str,
) -> QuotaVerdict {
    let fallback_reset = || (Utc::now() + Duration::hours(1)).to_rfc3339();

    let snapshot = match gemini_auth::fetch_available_models(
        state.upstream.control_client(),
        endpoint,
        token,
        project,
    )
    .await
    {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!("Quota snapshot failed for account {}: {}", account.id, e);
            let reset_time = fallback_reset();
            let _ = state
                .store
                .mark_model_exhausted(&account.id, gemini_model, &reset_time);
            return QuotaVerdict::Exhausted { reset_time };
        }
    };

    let credits = gemini_auth::extract_credits_info(&snapshot);
    if let Err(e) = state
        .store
        .merge_other(&account.id, json!({"creditsInfo": credits}))
    {
        tracing::error!("Failed to persist quota snapshot for {}: {}", account.id, e);
    }

    let (residual, reset_time) = gemini_auth::extract_model_quota(&snapshot, gemini_model);

    if residual > RATE_LIMIT_RESIDUAL_FRACTION {
        tracing::warn!(
            "Account {} rate limited on {} with {:.2}% remaining",
            account.id,
            gemini_model,
            residual * 100.0
        );
        return QuotaVerdict::RateLimited { residual };
    }

    let reset_time = reset_time.unwrap_or_else(fallback_reset);
    let _ = state
        .store
        .mark_model_exhausted(&account.id, gemini_model, &reset_time);
    QuotaVerdict::Exhausted { reset_time }
}
