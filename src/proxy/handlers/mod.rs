pub mod accounts;
pub mod claude;
pub mod gemini;
pub mod openai;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::mappers::sink::EventSink;
use crate::proxy::mappers::translator::ResponseTranslator;
use crate::proxy::parsers::ProviderEvent;
use crate::proxy::server::AppState;
use crate::store::{Account, AccountKind};

/// Resolve a forced `X-Account-ID` header if present: 404 for unknown ids,
/// 403 for disabled accounts.
pub(crate) fn forced_account(
    state: &AppState,
    headers: &HeaderMap,
) -> GatewayResult<Option<Account>> {
    let Some(id) = headers.get("x-account-id").and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };

    let account = state
        .store
        .get(id)?
        .ok_or_else(|| GatewayError::NotFound(format!("account does not exist: {}", id)))?;
    if !account.enabled {
        return Err(GatewayError::Forbidden(format!(
            "account is disabled: {}",
            id
        )));
    }
    Ok(Some(account))
}

/// Incremental byte-stream decoder used by the SSE plumbing below.
pub(crate) trait StreamDecoder: Send + 'static {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProviderEvent>;
    fn flush(&mut self) -> Vec<ProviderEvent>;
}

impl StreamDecoder for crate::proxy::parsers::event_stream::EventStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProviderEvent> {
        self.feed(chunk)
    }
    fn flush(&mut self) -> Vec<ProviderEvent> {
        self.flush()
    }
}

impl StreamDecoder for crate::proxy::parsers::sse::SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProviderEvent> {
        self.feed(chunk)
    }
    fn flush(&mut self) -> Vec<ProviderEvent> {
        self.flush()
    }
}

/// Pipe an upstream byte stream through decoder + translator into a public
/// SSE response. Dropping the response body cancels the upstream read.
pub(crate) fn sse_response<D: StreamDecoder>(
    upstream: reqwest::Response,
    mut decoder: D,
    mut translator: ResponseTranslator<Box<dyn EventSink>>,
) -> Response {
    let stream = async_stream::stream! {
        let mut bytes = upstream.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.feed(&chunk) {
                        for frame in translator.on_event(event) {
                            yield Ok::<Bytes, std::convert::Infallible>(frame);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Upstream stream error: {}", e);
                    for frame in translator.fail(&format!("upstream stream error: {}", e)) {
                        yield Ok(frame);
                    }
                    return;
                }
            }
        }

        for event in decoder.flush() {
            for frame in translator.on_event(event) {
                yield Ok(frame);
            }
        }
        for frame in translator.finish() {
            yield Ok(frame);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Channel counts for the router: live enabled accounts per provider, with
/// the env fallback counting as one CodeWhisperer account.
pub(crate) fn channel_counts(state: &AppState) -> GatewayResult<(usize, usize)> {
    let mut cw = state
        .store
        .list_enabled(Some(AccountKind::Codewhisperer))?
        .len();
    let gemini = state.store.list_enabled(Some(AccountKind::Gemini))?.len();

    if cw == 0 && state.config.fallback.is_complete() {
        cw = 1;
    }
    Ok((cw, gemini))
}
