// Output formatting for the response translator.
//
// The translator drives one state machine; the dialect-specific frame
// shapes live behind this capability so the Claude and OpenAI surfaces
// share a single translation path.

use bytes::Bytes;
use serde_json::json;
use uuid::Uuid;

use crate::proxy::mappers::claude::models::Usage;

#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub message_id: String,
    pub model: String,
    pub input_tokens: u32,
}

pub trait EventSink: Send {
    fn message_start(&mut self, meta: &MessageMeta) -> Vec<Bytes>;
    fn text_block_start(&mut self, index: usize) -> Vec<Bytes>;
    fn text_delta(&mut self, index: usize, text: &str) -> Vec<Bytes>;
    fn tool_block_start(&mut self, index: usize, tool_use_id: &str, name: &str) -> Vec<Bytes>;
    fn tool_input_delta(&mut self, index: usize, fragment: &str) -> Vec<Bytes>;
    fn block_stop(&mut self, index: usize) -> Vec<Bytes>;
    fn message_stop(&mut self, stop_reason: &str, usage: Usage) -> Vec<Bytes>;
    /// Mid-stream failure: emitted after the first downstream byte, when an
    /// HTTP status can no longer change.
    fn error(&mut self, message: &str) -> Vec<Bytes>;
}

impl EventSink for Box<dyn EventSink> {
    fn message_start(&mut self, meta: &MessageMeta) -> Vec<Bytes> {
        (**self).message_start(meta)
    }
    fn text_block_start(&mut self, index: usize) -> Vec<Bytes> {
        (**self).text_block_start(index)
    }
    fn text_delta(&mut self, index: usize, text: &str) -> Vec<Bytes> {
        (**self).text_delta(index, text)
    }
    fn tool_block_start(&mut self, index: usize, tool_use_id: &str, name: &str) -> Vec<Bytes> {
        (**self).tool_block_start(index, tool_use_id, name)
    }
    fn tool_input_delta(&mut self, index: usize, fragment: &str) -> Vec<Bytes> {
        (**self).tool_input_delta(index, fragment)
    }
    fn block_stop(&mut self, index: usize) -> Vec<Bytes> {
        (**self).block_stop(index)
    }
    fn message_stop(&mut self, stop_reason: &str, usage: Usage) -> Vec<Bytes> {
        (**self).message_stop(stop_reason, usage)
    }
    fn error(&mut self, message: &str) -> Vec<Bytes> {
        (**self).error(message)
    }
}

fn sse_frame(event_type: &str, data: serde_json::Value) -> Bytes {
    Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        event_type,
        serde_json::to_string(&data).unwrap_or_default()
    ))
}

/// Claude dialect: `event:`-named SSE frames.
#[derive(Default)]
pub struct ClaudeSseSink;

impl EventSink for ClaudeSseSink {
    fn message_start(&mut self, meta: &MessageMeta) -> Vec<Bytes> {
        vec![
            sse_frame(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": meta.message_id,
                        "type": "message",
                        "role": "assistant",
                        "content": [],
                        "model": meta.model,
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": meta.input_tokens, "output_tokens": 0},
                    }
                }),
            ),
            sse_frame("ping", json!({"type": "ping"})),
        ]
    }

    fn text_block_start(&mut self, index: usize) -> Vec<Bytes> {
        vec![sse_frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""},
            }),
        )]
    }

    fn text_delta(&mut self, index: usize, text: &str) -> Vec<Bytes> {
        vec![sse_frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text},
            }),
        )]
    }

    fn tool_block_start(&mut self, index: usize, tool_use_id: &str, name: &str) -> Vec<Bytes> {
        vec![sse_frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {
                    "type": "tool_use",
                    "id": tool_use_id,
                    "name": name,
                    "input": {},
                },
            }),
        )]
    }

    fn tool_input_delta(&mut self, index: usize, fragment: &str) -> Vec<Bytes> {
        vec![sse_frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "input_json_delta", "partial_json": fragment},
            }),
        )]
    }

    fn block_stop(&mut self, index: usize) -> Vec<Bytes> {
        vec![sse_frame(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        )]
    }

    fn message_stop(&mut self, stop_reason: &str, usage: Usage) -> Vec<Bytes> {
        vec![
            sse_frame(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                    "usage": {"input_tokens": usage.input_tokens, "output_tokens": usage.output_tokens},
                }),
            ),
            sse_frame(
                "message_stop",
                json!({
                    "type": "message_stop",
                    "stop_reason": stop_reason,
                    "usage": {"input_tokens": usage.input_tokens, "output_tokens": usage.output_tokens},
                }),
            ),
        ]
    }

    fn error(&mut self, message: &str) -> Vec<Bytes> {
        vec![sse_frame(
            "error",
            json!({
                "type": "error",
                "error": {"type": "api_error", "message": message},
            }),
        )]
    }
}

/// OpenAI dialect: `chat.completion.chunk` data frames ending in [DONE].
pub struct OpenAiChunkSink {
    completion_id: String,
    created: i64,
    model: String,
    role_sent: bool,
    tool_call_index: i64,
    current_tool_index: i64,
    tool_used: bool,
}

impl OpenAiChunkSink {
    pub fn new() -> Self {
        Self {
            completion_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: String::new(),
            role_sent: false,
            tool_call_index: 0,
            current_tool_index: 0,
            tool_used: false,
        }
    }

    fn chunk(&mut self, mut delta: serde_json::Value, finish_reason: Option<&str>) -> Bytes {
        if !self.role_sent {
            delta["role"] = json!("assistant");
            self.role_sent = true;
        }

        let body = json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        Bytes::from(format!("data: {}\n\n", body))
    }

    fn done() -> Bytes {
        Bytes::from("data: [DONE]\n\n")
    }
}

impl Default for OpenAiChunkSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for OpenAiChunkSink {
    fn message_start(&mut self, meta: &MessageMeta) -> Vec<Bytes> {
        self.model = meta.model.clone();
        vec![self.chunk(json!({}), None)]
    }

    fn text_block_start(&mut self, _index: usize) -> Vec<Bytes> {
        Vec::new()
    }

    fn text_delta(&mut self, _index: usize, text: &str) -> Vec<Bytes> {
        vec![self.chunk(json!({"content": text}), None)]
    }

    fn tool_block_start(&mut self, _index: usize, tool_use_id: &str, name: &str) -> Vec<Bytes> {
        self.tool_used = true;
        self.current_tool_index = self.tool_call_index;
        self.tool_call_index += 1;

        vec![self.chunk(
            json!({
                "tool_calls": [{
                    "index": self.current_tool_index,
                    "id": tool_use_id,
                    "type": "function",
                    "function": {"name": name, "arguments": ""},
                }]
            }),
            None,
        )]
    }

    fn tool_input_delta(&mut self, _index: usize, fragment: &str) -> Vec<Bytes> {
        vec![self.chunk(
            json!({
                "tool_calls": [{
                    "index": self.current_tool_index,
                    "function": {"arguments": fragment},
                }]
            }),
            None,
        )]
    }

    fn block_stop(&mut self, _index: usize) -> Vec<Bytes> {
        Vec::new()
    }

    fn message_stop(&mut self, stop_reason: &str, usage: Usage) -> Vec<Bytes> {
        let finish_reason = match stop_reason {
            "tool_use" => "tool_calls",
            "max_tokens" => "length",
            _ => "stop",
        };

        let body = json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": finish_reason,
            }],
            "usage": {
                "prompt_tokens": usage.input_tokens,
                "completion_tokens": usage.output_tokens,
                "total_tokens": usage.input_tokens + usage.output_tokens,
            },
        });

        vec![Bytes::from(format!("data: {}\n\n", body)), Self::done()]
    }

    fn error(&mut self, message: &str) -> Vec<Bytes> {
        let body = json!({
            "error": {"message": message, "type": "api_error"},
        });
        vec![Bytes::from(format!("data: {}\n\n", body)), Self::done()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(frames: Vec<Bytes>) -> String {
        frames
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    fn meta() -> MessageMeta {
        MessageMeta {
            message_id: "msg_1".into(),
            model: "claude-sonnet-4.5".into(),
            input_tokens: 5,
        }
    }

    #[test]
    fn test_claude_message_start_then_ping() {
        let mut sink = ClaudeSseSink;
        let out = collect(sink.message_start(&meta()));
        let start_pos = out.find("event: message_start").unwrap();
        let ping_pos = out.find("event: ping").unwrap();
        assert!(start_pos < ping_pos);
        assert!(out.contains(r#""input_tokens":5"#));
    }

    #[test]
    fn test_claude_tool_frames() {
        let mut sink = ClaudeSseSink;
        let out = collect(sink.tool_block_start(1, "t1", "search"));
        assert!(out.contains(r#""type":"tool_use""#));
        assert!(out.contains(r#""id":"t1""#));
        assert!(out.contains(r#""input":{}"#));

        let out = collect(sink.tool_input_delta(1, r#"{"q":"#));
        assert!(out.contains(r#""type":"input_json_delta""#));
        assert!(out.contains(r#""partial_json":"{\"q\":""#));
    }

    #[test]
    fn test_claude_message_stop_carries_usage() {
        let mut sink = ClaudeSseSink;
        let out = collect(sink.message_stop(
            "end_turn",
            Usage {
                input_tokens: 3,
                output_tokens: 9,
            },
        ));
        assert!(out.contains("event: message_delta"));
        assert!(out.contains("event: message_stop"));
        assert!(out.contains(r#""stop_reason":"end_turn""#));
        assert!(out.contains(r#""output_tokens":9"#));
    }

    #[test]
    fn test_openai_first_delta_carries_role() {
        let mut sink = OpenAiChunkSink::new();
        sink.model = "gpt-test".into();
        let out = collect(sink.text_delta(0, "hi"));
        assert!(out.contains(r#""role":"assistant""#));
        assert!(out.contains(r#""content":"hi""#));

        // Second delta has no role.
        let out = collect(sink.text_delta(0, "again"));
        assert!(!out.contains(r#""role""#));
    }

    #[test]
    fn test_openai_tool_call_indices_advance() {
        let mut sink = OpenAiChunkSink::new();
        let first = collect(sink.tool_block_start(1, "t1", "search"));
        assert!(first.contains(r#""index":0"#));
        let _ = sink.tool_input_delta(1, "{}");

        let second = collect(sink.tool_block_start(2, "t2", "fetch"));
        assert!(second.contains(r#""index":1"#));
    }

    #[test]
    fn test_openai_finish_and_done() {
        let mut sink = OpenAiChunkSink::new();
        let _ = sink.tool_block_start(0, "t1", "search");
        let out = collect(sink.message_stop(
            "tool_use",
            Usage {
                input_tokens: 1,
                output_tokens: 2,
            },
        ));
        assert!(out.contains(r#""finish_reason":"tool_calls""#));
        assert!(out.contains(r#""completion_tokens":2"#));
        assert!(out.ends_with("data: [DONE]\n\n"));
    }
}
