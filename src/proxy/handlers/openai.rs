// OpenAI-dialect endpoints: /v1/chat/completions and /v1/models.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::common::tokens::{
    count_tokens, estimate_input_tokens, is_zero_input_token_model,
};
use crate::proxy::handlers::{self, forced_account};
use crate::proxy::mappers::claude::models::ClaudeRequest;
use crate::proxy::mappers::codewhisperer::Dialect;
use crate::proxy::mappers::openai::bracket::{deduplicate_tool_calls, extract_bracket_calls};
use crate::proxy::mappers::openai::models::{
    AssistantMessage, Choice, OpenAiRequest, OpenAiResponse, OpenAiUsage, ToolCall,
    ToolCallFunction,
};
use crate::proxy::mappers::openai::to_claude_request;
use crate::proxy::mappers::sink::OpenAiChunkSink;
use crate::proxy::middleware::require_api_key;
use crate::proxy::parsers::event_stream::EventStreamParser;
use crate::proxy::parsers::ProviderEvent;
use crate::proxy::server::AppState;
use crate::router;
use crate::store::AccountKind;

/// Catalogue served by GET /v1/models: every id the model maps accept.
const MODEL_CATALOG: &[&str] = &[
    "claude-sonnet-4.5",
    "claude-sonnet-4-5",
    "claude-sonnet-4",
    "claude-haiku-4.5",
    "claude-sonnet-4-5-thinking",
    "gemini-2.5-flash",
    "gemini-2.5-flash-thinking",
    "gemini-2.5-flash-lite",
    "gemini-2.5-pro",
    "gemini-3-pro-low",
    "gemini-3-pro-high",
    "gpt-oss-120b-medium",
];

pub async fn handle_list_models() -> impl IntoResponse {
    let data: Vec<Value> = MODEL_CATALOG
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1706745600,
                "owned_by": "qgate",
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

/// POST /v1/chat/completions — OpenAI dialect, streaming or unary.
pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OpenAiRequest>,
) -> Response {
    if let Err(e) = require_api_key(&state.config, &headers) {
        return e.into_response();
    }

    tracing::info!(
        "OpenAI request for model {} (stream: {})",
        request.model,
        request.stream
    );

    let claude_request = match to_claude_request(&request) {
        Ok(normalised) => normalised,
        Err(e) => return e.into_response(),
    };

    let forced = match forced_account(&state, &headers) {
        Ok(forced) => forced,
        Err(e) => return e.into_response(),
    };

    let channel = match &forced {
        Some(account) => account.kind,
        None => {
            let (cw, gemini) = match handlers::channel_counts(&state) {
                Ok(counts) => counts,
                Err(e) => return e.into_response(),
            };
            match router::route_channel(&claude_request.model, cw, gemini, &mut rand::thread_rng())
            {
                Some(channel) => channel,
                None => {
                    return GatewayError::NoAccountAvailable(format!(
                        "no enabled account can serve {}",
                        claude_request.model
                    ))
                    .into_response()
                }
            }
        }
    };

    let result = if request.stream {
        match channel {
            AccountKind::Codewhisperer => {
                super::claude::stream_codewhisperer(
                    &state,
                    &claude_request,
                    Dialect::OpenAi,
                    Box::new(OpenAiChunkSink::new()),
                    forced,
                )
                .await
            }
            AccountKind::Gemini => {
                super::gemini::stream_gemini(
                    &state,
                    &claude_request,
                    Box::new(OpenAiChunkSink::new()),
                    forced,
                    true,
                )
                .await
            }
        }
    } else {
        match channel {
            AccountKind::Codewhisperer => {
                codewhisperer_completion(&state, &claude_request, forced).await
            }
            AccountKind::Gemini => gemini_completion(&state, &claude_request, forced).await,
        }
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Accumulates provider events into a whole-message view for the unary
/// response shape.
#[derive(Default)]
struct CompletionCollector {
    text: String,
    tool_calls: Vec<ToolCall>,
    open_call: Option<(String, String, String)>,
    usage: Option<(u32, u32)>,
    finish_reason: Option<String>,
}

impl CompletionCollector {
    fn absorb(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::TextDelta { text } => self.text.push_str(&text),
            ProviderEvent::ToolUseFragment {
                tool_use_id,
                name,
                input,
                stop,
            } => {
                if self.open_call.is_none() {
                    if let Some(name) = name {
                        self.open_call = Some((tool_use_id, name, String::new()));
                    }
                }
                if let Some((_, _, args)) = self.open_call.as_mut() {
                    if let Some(fragment) = input {
                        args.push_str(&fragment);
                    }
                }
                if stop {
                    if let Some((id, name, args)) = self.open_call.take() {
                        self.tool_calls.push(ToolCall {
                            id,
                            call_type: "function".to_string(),
                            function: ToolCallFunction {
                                name,
                                arguments: if args.is_empty() { "{}".to_string() } else { args },
                            },
                        });
                    }
                }
            }
            ProviderEvent::Usage {
                input_tokens,
                output_tokens,
            } => self.usage = Some((input_tokens, output_tokens)),
            ProviderEvent::Finish { reason } => self.finish_reason = Some(reason),
            _ => {}
        }
    }
}

fn build_completion_response(
    request: &ClaudeRequest,
    state: &AppState,
    collector: CompletionCollector,
) -> Response {
    // Rescue bracket-format calls hiding in the text, then de-duplicate
    // against the structured ones.
    let (clean_text, bracket_calls) = extract_bracket_calls(&collector.text);
    let mut tool_calls = collector.tool_calls;
    tool_calls.extend(bracket_calls);
    let tool_calls = deduplicate_tool_calls(tool_calls);

    let completion_tokens = count_tokens(&format!(
        "{}{}",
        clean_text,
        tool_calls
            .iter()
            .map(|c| c.function.arguments.as_str())
            .collect::<String>()
    ));
    let prompt_tokens =
        if is_zero_input_token_model(&request.model, &state.config.zero_input_token_models) {
            0
        } else {
            estimate_input_tokens(request)
        };
    let (prompt_tokens, completion_tokens) = collector
        .usage
        .unwrap_or((prompt_tokens, completion_tokens));

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls"
    } else if collector.finish_reason.as_deref() == Some("MAX_TOKENS") {
        "length"
    } else {
        "stop"
    };

    let response = OpenAiResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: request.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                // With tool calls present, content must be null.
                content: if tool_calls.is_empty() {
                    Some(clean_text)
                } else {
                    None
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: OpenAiUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    };

    Json(response).into_response()
}

async fn codewhisperer_completion(
    state: &AppState,
    request: &ClaudeRequest,
    forced: Option<crate::store::Account>,
) -> GatewayResult<Response> {
    let body = crate::proxy::mappers::codewhisperer::transform_claude_request(
        request,
        state.config.profile_arn.as_deref(),
        Dialect::OpenAi,
    )?;

    let (upstream, _account) =
        super::claude::open_codewhisperer_stream(state, &body, forced).await?;

    let bytes = upstream.bytes().await.map_err(GatewayError::Network)?;

    let mut parser = EventStreamParser::new();
    let mut collector = CompletionCollector::default();
    for event in parser.feed(&bytes) {
        collector.absorb(event);
    }
    for event in parser.flush() {
        collector.absorb(event);
    }

    Ok(build_completion_response(request, state, collector))
}

async fn gemini_completion(
    state: &AppState,
    request: &ClaudeRequest,
    forced: Option<crate::store::Account>,
) -> GatewayResult<Response> {
    let payload = super::gemini::fetch_gemini_completion(state, request, forced).await?;

    let mut collector = CompletionCollector::default();

    if let Some(usage) = payload.get("usageMetadata") {
        collector.usage = Some((
            usage
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            usage
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        ));
    }

    if let Some(candidate) = payload
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    {
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    collector.text.push_str(text);
                }
                if let Some(call) = part.get("functionCall") {
                    let name = call
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    collector.tool_calls.push(ToolCall {
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| {
                                format!("{}-{}", name, Uuid::new_v4().simple())
                            }),
                        call_type: "function".to_string(),
                        function: ToolCallFunction {
                            name,
                            arguments: call
                                .get("args")
                                .map(|a| a.to_string())
                                .unwrap_or_else(|| "{}".to_string()),
                        },
                    });
                }
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(|f| f.as_str()) {
            collector.finish_reason = Some(reason.to_string());
        }
    }

    Ok(build_completion_response(request, state, collector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::store::AccountStore;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(
            Arc::new(GatewayConfig::default()),
            AccountStore::open_in_memory().unwrap(),
        )
    }

    fn claude_request() -> ClaudeRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4.5",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_model_catalog() {
        let response = handle_list_models().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn test_collector_assembles_tool_calls() {
        let mut collector = CompletionCollector::default();
        collector.absorb(ProviderEvent::TextDelta {
            text: "checking ".into(),
        });
        collector.absorb(ProviderEvent::ToolUseFragment {
            tool_use_id: "t1".into(),
            name: Some("search".into()),
            input: Some("{\"q\":".into()),
            stop: false,
        });
        collector.absorb(ProviderEvent::ToolUseFragment {
            tool_use_id: "t1".into(),
            name: None,
            input: Some("\"dogs\"}".into()),
            stop: true,
        });

        assert_eq!(collector.text, "checking ");
        assert_eq!(collector.tool_calls.len(), 1);
        assert_eq!(collector.tool_calls[0].function.arguments, "{\"q\":\"dogs\"}");
    }

    #[test]
    fn test_unary_response_with_bracket_rescue() {
        let state = state();
        let mut collector = CompletionCollector::default();
        collector.text = r#"Sure. [Called search with args: {"q": "cats"}]"#.to_string();

        let response = build_completion_response(&claude_request(), &state, collector);
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn test_finish_reason_without_tools_is_stop() {
        let state = state();
        let collector = CompletionCollector {
            text: "plain answer".into(),
            ..Default::default()
        };
        let response = build_completion_response(&claude_request(), &state, collector);
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
