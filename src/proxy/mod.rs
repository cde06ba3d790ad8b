pub mod common;
pub mod handlers;
pub mod mappers;
pub mod middleware;
pub mod parsers;
pub mod server;
pub mod upstream;

pub use server::AppState;

// Whole-pipeline checks: provider wire bytes through parser and translator
// to the public SSE transcript.
#[cfg(test)]
mod pipeline_tests {
    use crate::proxy::mappers::sink::ClaudeSseSink;
    use crate::proxy::mappers::translator::ResponseTranslator;
    use crate::proxy::parsers::event_stream::EventStreamParser;
    use crate::proxy::parsers::sse::SseParser;
    use bytes::Bytes;

    fn wire_frame(event_type: &str, payload: &str) -> Vec<u8> {
        let name = ":event-type";
        let mut headers = Vec::new();
        headers.push(name.len() as u8);
        headers.extend_from_slice(name.as_bytes());
        headers.push(7u8);
        headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
        headers.extend_from_slice(event_type.as_bytes());

        let total_len = 12 + headers.len() + payload.len() + 4;
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&headers);
        out.extend_from_slice(payload.as_bytes());
        out.extend_from_slice(&[0; 4]);
        out
    }

    fn run_codewhisperer(frames: Vec<Vec<u8>>, input_tokens: u32) -> String {
        let mut parser = EventStreamParser::new();
        let mut translator =
            ResponseTranslator::new(ClaudeSseSink, "claude-sonnet-4.5", input_tokens);
        let mut out: Vec<Bytes> = Vec::new();

        for frame in frames {
            // Chunk boundaries are arbitrary on the wire; split mid-frame.
            let (a, b) = frame.split_at(frame.len() / 2);
            for event in parser.feed(a) {
                out.extend(translator.on_event(event));
            }
            for event in parser.feed(b) {
                out.extend(translator.on_event(event));
            }
        }
        for event in parser.flush() {
            out.extend(translator.on_event(event));
        }
        out.extend(translator.finish());

        out.iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    fn event_names(transcript: &str) -> Vec<String> {
        transcript
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .map(|s| s.to_string())
            .collect()
    }

    fn parsed_events(transcript: &str) -> Vec<(String, serde_json::Value)> {
        let mut out = Vec::new();
        let mut current: Option<String> = None;
        for line in transcript.lines() {
            if let Some(name) = line.strip_prefix("event: ") {
                current = Some(name.to_string());
            } else if let Some(data) = line.strip_prefix("data: ") {
                if let (Some(name), Ok(value)) = (current.take(), serde_json::from_str(data)) {
                    out.push((name, value));
                }
            }
        }
        out
    }

    #[test]
    fn test_simple_text_completion_end_to_end() {
        let transcript = run_codewhisperer(
            vec![
                wire_frame("initial-response", r#"{"conversationId":"conv-7"}"#),
                wire_frame("assistantResponseEvent", r#"{"content":"hel"}"#),
                wire_frame("assistantResponseEvent", r#"{"content":"lo"}"#),
            ],
            3,
        );

        assert_eq!(
            event_names(&transcript),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(transcript.contains(r#""id":"conv-7""#));
        assert!(transcript.contains(r#""text":"hel""#));
        assert!(transcript.contains(r#""text":"lo""#));
        assert!(transcript.contains(r#""stop_reason":"end_turn""#));
    }

    #[test]
    fn test_tool_use_single_call_end_to_end() {
        let transcript = run_codewhisperer(
            vec![
                wire_frame("initial-response", r#"{"conversationId":"conv-8"}"#),
                wire_frame("assistantResponseEvent", r#"{"content":"Looking up…"}"#),
                wire_frame(
                    "toolUseEvent",
                    r#"{"toolUseId":"t1","name":"search","input":"{\"q\":"}"#,
                ),
                wire_frame(
                    "toolUseEvent",
                    r#"{"toolUseId":"t1","input":"\"dogs\"}","stop":true}"#,
                ),
            ],
            0,
        );

        // Text block 0 opens, streams, closes; tool block 1 opens with id
        // and name, streams both fragments verbatim, closes.
        assert!(transcript.contains(r#""text":"Looking up…""#));

        let events = parsed_events(&transcript);
        let text_stop = events
            .iter()
            .position(|(n, v)| n == "content_block_stop" && v["index"] == 0)
            .unwrap();
        let tool_start = events
            .iter()
            .position(|(n, v)| {
                n == "content_block_start" && v["content_block"]["type"] == "tool_use"
            })
            .unwrap();
        assert!(text_stop < tool_start);

        let (_, start) = &events[tool_start];
        assert_eq!(start["content_block"]["id"], "t1");
        assert_eq!(start["content_block"]["name"], "search");
        assert_eq!(start["index"], 1);

        assert!(transcript.contains(r#""partial_json":"{\"q\":""#));
        assert!(transcript.contains(r#""partial_json":"\"dogs\"}""#));
        assert!(events
            .iter()
            .any(|(n, v)| n == "content_block_stop" && v["index"] == 1));
        assert!(transcript.contains(r#""stop_reason":"tool_use""#));
        assert_eq!(event_names(&transcript).last().unwrap(), "message_stop");
    }

    #[test]
    fn test_gemini_sse_end_to_end() {
        let mut parser = SseParser::new();
        let mut translator = ResponseTranslator::new(ClaudeSseSink, "claude-sonnet-4-5", 2);
        let mut out: Vec<Bytes> = Vec::new();

        let chunks: Vec<&[u8]> = vec![
            br#"data: {"response":{"responseId":"r9","candidates":[{"content":{"parts":[{"text":"bonjour"}]}}]}}"#,
            b"\n\n",
            br#"data: {"response":{"candidates":[{"content":{"parts":[{"functionCall":{"id":"f1","name":"lookup","args":{"q":"cats"}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":11,"candidatesTokenCount":23}}}"#,
            b"\n\n",
        ];
        for chunk in chunks {
            for event in parser.feed(chunk) {
                out.extend(translator.on_event(event));
            }
        }
        for event in parser.flush() {
            out.extend(translator.on_event(event));
        }
        out.extend(translator.finish());

        let transcript: String = out
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();

        assert!(transcript.contains(r#""id":"r9""#));
        assert!(transcript.contains(r#""text":"bonjour""#));
        // Function call arrives as the three-step tool block.
        let events = parsed_events(&transcript);
        let tool_start = events
            .iter()
            .find(|(n, v)| n == "content_block_start" && v["content_block"]["type"] == "tool_use")
            .map(|(_, v)| v)
            .unwrap();
        assert_eq!(tool_start["content_block"]["id"], "f1");
        assert_eq!(tool_start["content_block"]["name"], "lookup");
        assert!(transcript.contains(r#""partial_json":"{\"q\":\"cats\"}""#));
        // Provider usage overrides the local estimate.
        assert!(transcript.contains(r#""input_tokens":11"#));
        assert!(transcript.contains(r#""output_tokens":23"#));
        assert!(transcript.contains(r#""stop_reason":"tool_use""#));

        let names = event_names(&transcript);
        let starts = names.iter().filter(|n| *n == "content_block_start").count();
        let stops = names.iter().filter(|n| *n == "content_block_stop").count();
        assert_eq!(starts, stops);
    }
}
