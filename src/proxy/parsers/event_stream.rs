// Decoder for the AWS binary event-stream framing used by CodeWhisperer.
//
// Frame layout:
//   prelude (12 bytes): total-length u32 BE | headers-length u32 BE | prelude CRC
//   headers: repeated { name-len u8, name, value-type u8, value-len u16 BE, value }
//   payload: bytes [12 + headers-length .. total-length - 4]
//   trailing message CRC (4 bytes)
//
// CRCs are not verified; resynchronisation on malformed lengths covers the
// corruption cases that matter in practice.

use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use super::ProviderEvent;

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = 16;
/// Upper bound on plausible frame/header sizes.
const MAX_FRAME_LEN: usize = 2_000_000;
/// After this many resync steps the buffer is considered garbage.
const MAX_DESYNC_ERRORS: u32 = 1024;

/// String-typed header value marker.
const HEADER_VALUE_STRING: u8 = 7;

pub struct EventStreamParser {
    buffer: BytesMut,
    error_count: u32,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            error_count: 0,
        }
    }

    /// Feed a chunk of upstream bytes, returning every event that became
    /// complete. A frame is never decoded before all its bytes arrived.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProviderEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while self.buffer.len() >= PRELUDE_LEN {
            let total_len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            let headers_len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;

            if total_len < MIN_FRAME_LEN
                || total_len > MAX_FRAME_LEN
                || headers_len > MAX_FRAME_LEN
                || PRELUDE_LEN + headers_len + 4 > total_len
            {
                // Desynchronised; slide one byte and retry.
                self.buffer.advance(1);
                self.error_count += 1;
                if self.error_count > MAX_DESYNC_ERRORS {
                    tracing::error!("Event-stream parser lost sync, discarding buffer");
                    self.buffer.clear();
                    self.error_count = 0;
                }
                continue;
            }

            if self.buffer.len() < total_len {
                break;
            }

            let frame = self.buffer.split_to(total_len);
            let headers = parse_headers(&frame[PRELUDE_LEN..PRELUDE_LEN + headers_len]);
            let payload = &frame[PRELUDE_LEN + headers_len..total_len - 4];

            if let Some(event) = decode_frame(&headers, payload) {
                events.push(event);
            }
        }

        if !events.is_empty() {
            self.error_count = 0;
        }
        events
    }

    /// Rescue step for stream end: a lenient scan of the remaining buffer
    /// for JSON objects. Matters for non-streaming callers that feed the
    /// whole body at once.
    pub fn flush(&mut self) -> Vec<ProviderEvent> {
        static JSON_OBJECT: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap());

        if self.buffer.is_empty() {
            return Vec::new();
        }

        tracing::info!(
            "Flushing event-stream buffer, {} bytes remaining",
            self.buffer.len()
        );

        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();

        let mut events = Vec::new();
        for m in JSON_OBJECT.find_iter(&text) {
            if let Ok(payload) = serde_json::from_str::<Value>(m.as_str()) {
                if let Some(event) = map_payload(&payload) {
                    events.push(event);
                }
            }
        }
        events
    }

    pub fn has_remaining_data(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn parse_headers(data: &[u8]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let name_len = data[offset] as usize;
        offset += 1;
        if offset + name_len > data.len() {
            break;
        }
        let name = String::from_utf8_lossy(&data[offset..offset + name_len]).into_owned();
        offset += name_len;

        if offset >= data.len() {
            break;
        }
        let value_type = data[offset];
        offset += 1;

        if offset + 2 > data.len() {
            break;
        }
        let value_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;

        if offset + value_len > data.len() {
            break;
        }
        if value_type == HEADER_VALUE_STRING {
            let value = String::from_utf8_lossy(&data[offset..offset + value_len]).into_owned();
            headers.insert(name, value);
        }
        offset += value_len;
    }

    headers
}

fn decode_frame(headers: &HashMap<String, String>, payload: &[u8]) -> Option<ProviderEvent> {
    let event_type = headers
        .get(":event-type")
        .or_else(|| headers.get("event-type"))
        .map(|s| s.as_str())
        .unwrap_or("");

    if payload.is_empty() {
        return None;
    }

    let Ok(text) = std::str::from_utf8(payload) else {
        return Some(ProviderEvent::Raw {
            bytes: payload.to_vec(),
        });
    };
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        return Some(ProviderEvent::Raw {
            bytes: payload.to_vec(),
        });
    };

    match event_type {
        "initial-response" => Some(ProviderEvent::MessageStart {
            conversation_id: json
                .get("conversationId")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        }),
        "assistantResponseEvent" | "toolUseEvent" => map_payload(&json),
        other => {
            tracing::debug!("Skipping event-stream frame of type {:?}", other);
            None
        }
    }
}

/// Classify a bare JSON payload by shape; shared with the flush rescue path
/// where no headers are available.
fn map_payload(json: &Value) -> Option<ProviderEvent> {
    if let Some(tool_use_id) = json.get("toolUseId").and_then(|v| v.as_str()) {
        let input = json.get("input").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        return Some(ProviderEvent::ToolUseFragment {
            tool_use_id: tool_use_id.to_string(),
            name: json
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            input: input.filter(|s| !s.is_empty()),
            stop: json.get("stop").and_then(|v| v.as_bool()).unwrap_or(false),
        });
    }

    if let Some(content) = json.get("content").and_then(|v| v.as_str()) {
        return Some(ProviderEvent::TextDelta {
            text: content.to_string(),
        });
    }

    if json.get("toolUses").is_some() {
        return Some(ProviderEvent::AssistantEnd);
    }

    if let Some(conversation_id) = json.get("conversationId").and_then(|v| v.as_str()) {
        return Some(ProviderEvent::MessageStart {
            conversation_id: conversation_id.to_string(),
        });
    }

    tracing::warn!("Unrecognised event payload: {}", json);
    None
}
