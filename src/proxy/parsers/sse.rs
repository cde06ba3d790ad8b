// Decoder for the Gemini Cloud Assist SSE stream.
//
// Chunks arrive on arbitrary byte boundaries, including mid-scalar for
// multi-byte UTF-8; undecodable tail bytes are carried to the next chunk
// and never decoded partially.

use serde_json::Value;
use uuid::Uuid;

use super::ProviderEvent;

pub struct SseParser {
    text_buffer: String,
    byte_tail: Vec<u8>,
    started: bool,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            text_buffer: String::new(),
            byte_tail: Vec::new(),
            started: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProviderEvent> {
        let mut data = std::mem::take(&mut self.byte_tail);
        data.extend_from_slice(chunk);

        match std::str::from_utf8(&data) {
            Ok(text) => self.text_buffer.push_str(text),
            Err(e) => {
                let valid = e.valid_up_to();
                self.text_buffer
                    .push_str(std::str::from_utf8(&data[..valid]).unwrap());
                self.byte_tail = data[valid..].to_vec();
            }
        }

        let mut events = Vec::new();
        while let Some(pos) = self.text_buffer.find('\n') {
            let line: String = self.text_buffer.drain(..=pos).collect();
            self.process_line(line.trim(), &mut events);
        }
        events
    }

    /// Handle any final line that arrived without a trailing newline.
    pub fn flush(&mut self) -> Vec<ProviderEvent> {
        let rest = std::mem::take(&mut self.text_buffer);
        let mut events = Vec::new();
        if !rest.trim().is_empty() {
            self.process_line(rest.trim(), &mut events);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<ProviderEvent>) {
        if line.is_empty() || !line.starts_with("data:") {
            return;
        }

        let data = line[5..].trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }

        let Ok(json) = serde_json::from_str::<Value>(data) else {
            tracing::warn!("Skipping undecodable SSE data line ({} bytes)", data.len());
            return;
        };

        // v1internal wraps the generate response in a `response` envelope.
        let payload = json.get("response").unwrap_or(&json);

        if !self.started {
            self.started = true;
            events.push(ProviderEvent::MessageStart {
                conversation_id: payload
                    .get("responseId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("msg_gemini")
                    .to_string(),
            });
        }

        if let Some(usage) = payload.get("usageMetadata") {
            let input = usage
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            let output = usage
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            if input > 0 || output > 0 {
                events.push(ProviderEvent::Usage {
                    input_tokens: input,
                    output_tokens: output,
                });
            }
        }

        let Some(candidates) = payload.get("candidates").and_then(|c| c.as_array()) else {
            return;
        };

        for candidate in candidates {
            if let Some(parts) = candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            events.push(ProviderEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }

                    if let Some(call) = part.get("functionCall") {
                        let name = call
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let id = call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| {
                                format!("{}-{}", name, Uuid::new_v4().simple())
                            });
                        let args = call
                            .get("args")
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "{}".to_string());

                        // Gemini delivers the whole call at once; one
                        // fragment with stop produces the start/delta/stop
                        // triple downstream.
                        events.push(ProviderEvent::ToolUseFragment {
                            tool_use_id: id,
                            name: Some(name),
                            input: Some(args),
                            stop: true,
                        });
                    }
                }
            }

            if let Some(reason) = candidate.get("finishReason").and_then(|f| f.as_str()) {
                events.push(ProviderEvent::Finish {
                    reason: reason.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_line(json: &str) -> Vec<u8> {
        format!("data: {}\n\n", json).into_bytes()
    }

    #[test]
    fn test_text_delta_with_message_start() {
        let mut parser = SseParser::new();
        let events = parser.feed(&data_line(
            r#"{"response":{"responseId":"r1","candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}}"#,
        ));

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ProviderEvent::MessageStart {
                conversation_id: "r1".to_string()
            }
        );
        assert_eq!(
            events[1],
            ProviderEvent::TextDelta {
                text: "Hello".to_string()
            }
        );
    }

    #[test]
    fn test_unwrapped_payload_accepted() {
        let mut parser = SseParser::new();
        let events = parser.feed(&data_line(
            r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#,
        ));
        assert!(events.contains(&ProviderEvent::TextDelta {
            text: "hi".to_string()
        }));
    }

    #[test]
    fn test_function_call_single_fragment_with_stop() {
        let mut parser = SseParser::new();
        let events = parser.feed(&data_line(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"c1","name":"search","args":{"q":"dogs"}}}]}}]}"#,
        ));

        let fragment = events
            .iter()
            .find(|e| matches!(e, ProviderEvent::ToolUseFragment { .. }))
            .unwrap();
        match fragment {
            ProviderEvent::ToolUseFragment {
                tool_use_id,
                name,
                input,
                stop,
            } => {
                assert_eq!(tool_use_id, "c1");
                assert_eq!(name.as_deref(), Some("search"));
                assert_eq!(input.as_deref(), Some(r#"{"q":"dogs"}"#));
                assert!(stop);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_usage_and_finish() {
        let mut parser = SseParser::new();
        let events = parser.feed(&data_line(
            r#"{"response":{"candidates":[{"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":34}}}"#,
        ));

        assert!(events.contains(&ProviderEvent::Usage {
            input_tokens: 12,
            output_tokens: 34
        }));
        assert!(events.contains(&ProviderEvent::Finish {
            reason: "MAX_TOKENS".to_string()
        }));
    }

    #[test]
    fn test_multibyte_boundary_safety() {
        let mut parser = SseParser::new();
        let wire = data_line(r#"{"candidates":[{"content":{"parts":[{"text":"日本語テキスト"}]}}]}"#);

        // Split inside a UTF-8 scalar.
        let split = wire
            .iter()
            .position(|&b| b > 0x7F)
            .map(|p| p + 1)
            .unwrap();
        let mut events = parser.feed(&wire[..split]);
        events.extend(parser.feed(&wire[split..]));

        assert!(events.contains(&ProviderEvent::TextDelta {
            text: "日本語テキスト".to_string()
        }));
    }

    #[test]
    fn test_done_marker_and_garbage_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: [DONE]\n\n").is_empty());
        assert!(parser.feed(b"data: {broken json\n\n").is_empty());
        assert!(parser.feed(b": comment line\n").is_empty());
    }

    #[test]
    fn test_flush_handles_unterminated_line() {
        let mut parser = SseParser::new();
        let wire = br#"data: {"candidates":[{"content":{"parts":[{"text":"tail"}]}}]}"#;
        assert!(parser.feed(wire).is_empty());

        let events = parser.flush();
        assert!(events.contains(&ProviderEvent::TextDelta {
            text: "tail".to_string()
        }));
    }
}
