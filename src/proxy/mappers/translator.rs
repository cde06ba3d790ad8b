// Provider events -> public stream, as one finite state machine:
//
//   Init -> MessageStarted -> (BlockStarted <-> BlockDelta)* -> MessageStopped
//
// Block indices run sequentially from 0; a text block and a tool block
// never share an index; every opened block is closed exactly once.

use bytes::Bytes;
use std::collections::HashSet;

use crate::proxy::common::tokens::count_tokens;
use crate::proxy::mappers::claude::models::Usage;
use crate::proxy::mappers::openai::bracket::extract_bracket_calls;
use crate::proxy::mappers::sink::{EventSink, MessageMeta};
use crate::proxy::parsers::ProviderEvent;

#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    None,
    Text(usize),
    Tool {
        index: usize,
        tool_use_id: String,
        name: String,
    },
}

/// Dedup key for a tool invocation; arguments are re-serialised through
/// serde_json when they parse so fragment boundaries and key order do not
/// defeat the comparison.
fn call_key(name: &str, arguments: &str) -> (String, String) {
    let normalised = serde_json::from_str::<serde_json::Value>(arguments)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| arguments.to_string());
    (name.to_string(), normalised)
}

pub struct ResponseTranslator<S: EventSink> {
    sink: S,
    model: String,
    input_tokens: u32,
    started: bool,
    finished: bool,
    next_index: usize,
    open_block: OpenBlock,
    seen_tool_ids: HashSet<String>,
    emitted_call_keys: HashSet<(String, String)>,
    current_tool_input: String,
    completed_tool_inputs: Vec<String>,
    emitted_text: String,
    used_tool: bool,
    rescue_bracket_calls: bool,
    provider_usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl<S: EventSink> ResponseTranslator<S> {
    pub fn new(sink: S, model: &str, input_tokens: u32) -> Self {
        Self {
            sink,
            model: model.to_string(),
            input_tokens,
            started: false,
            finished: false,
            next_index: 0,
            open_block: OpenBlock::None,
            seen_tool_ids: HashSet::new(),
            emitted_call_keys: HashSet::new(),
            current_tool_input: String::new(),
            completed_tool_inputs: Vec::new(),
            emitted_text: String::new(),
            used_tool: false,
            rescue_bracket_calls: false,
            provider_usage: None,
            finish_reason: None,
        }
    }

    /// Enable the stream-end rescue of legacy bracket-format tool calls
    /// (OpenAI dialect): trailing `[Called <name> with args: {...}]` text
    /// is re-emitted as a structured tool block before message stop.
    pub fn with_bracket_rescue(mut self, enabled: bool) -> Self {
        self.rescue_bracket_calls = enabled;
        self
    }

    pub fn on_event(&mut self, event: ProviderEvent) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }

        match event {
            ProviderEvent::MessageStart { conversation_id } => {
                self.ensure_started(Some(&conversation_id))
            }
            ProviderEvent::TextDelta { text } => self.on_text(&text),
            ProviderEvent::ToolUseFragment {
                tool_use_id,
                name,
                input,
                stop,
            } => self.on_tool_fragment(&tool_use_id, name.as_deref(), input.as_deref(), stop),
            ProviderEvent::AssistantEnd => self.close_open_block(),
            ProviderEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.provider_usage = Some(Usage {
                    input_tokens,
                    output_tokens,
                });
                Vec::new()
            }
            ProviderEvent::Finish { reason } => {
                self.finish_reason = Some(reason);
                Vec::new()
            }
            ProviderEvent::Raw { bytes } => {
                tracing::warn!("Dropping undecodable provider frame ({} bytes)", bytes.len());
                Vec::new()
            }
        }
    }

    /// Stream ended. Closes anything open and emits the terminal events;
    /// idempotent.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }

        let mut out = self.ensure_started(None);
        out.extend(self.close_open_block());

        if self.rescue_bracket_calls {
            out.extend(self.rescue_brackets());
        }

        let usage = self.provider_usage.unwrap_or_else(|| Usage {
            input_tokens: self.input_tokens,
            output_tokens: count_tokens(&format!(
                "{}{}",
                self.emitted_text,
                self.completed_tool_inputs.concat()
            )),
        });

        let stop_reason = if self.used_tool {
            "tool_use"
        } else if self.finish_reason.as_deref() == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };

        out.extend(self.sink.message_stop(stop_reason, usage));
        self.finished = true;
        out
    }

    /// Mid-stream failure: close the stream with an error frame.
    pub fn fail(&mut self, message: &str) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        let mut out = self.sink.error(message);
        self.finished = true;
        out.retain(|b| !b.is_empty());
        out
    }

    pub fn message_started(&self) -> bool {
        self.started
    }

    fn ensure_started(&mut self, conversation_id: Option<&str>) -> Vec<Bytes> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        let meta = MessageMeta {
            message_id: conversation_id.unwrap_or("unknown").to_string(),
            model: self.model.clone(),
            input_tokens: self.input_tokens,
        };
        self.sink.message_start(&meta)
    }

    fn on_text(&mut self, text: &str) -> Vec<Bytes> {
        let mut out = self.ensure_started(None);

        // A tool block never interleaves with text at one index.
        if matches!(self.open_block, OpenBlock::Tool { .. }) {
            out.extend(self.close_open_block());
        }

        if !matches!(self.open_block, OpenBlock::Text(_)) {
            let index = self.next_index;
            self.next_index += 1;
            self.open_block = OpenBlock::Text(index);
            out.extend(self.sink.text_block_start(index));
        }

        if let OpenBlock::Text(index) = self.open_block {
            if !text.is_empty() {
                self.emitted_text.push_str(text);
                out.extend(self.sink.text_delta(index, text));
            }
        }
        out
    }

    fn on_tool_fragment(
        &mut self,
        tool_use_id: &str,
        name: Option<&str>,
        input: Option<&str>,
        stop: bool,
    ) -> Vec<Bytes> {
        let mut out = self.ensure_started(None);

        let currently_open = match &self.open_block {
            OpenBlock::Tool {
                tool_use_id: open_id,
                ..
            } => open_id == tool_use_id,
            _ => false,
        };

        if !currently_open {
            // Text (or a different tool) is open; close it first.
            if !matches!(self.open_block, OpenBlock::None) {
                out.extend(self.close_open_block());
            }

            // The same id is never opened twice; a repeat after its stop is
            // a fresh block only when it carries new content.
            if self.seen_tool_ids.contains(tool_use_id) && input.is_none() {
                tracing::warn!("Skipping duplicate tool-use event for {}", tool_use_id);
                return out;
            }

            let Some(name) = name else {
                // Fragment for a block that never opened and carries no
                // name; nothing sensible to emit.
                return out;
            };

            self.seen_tool_ids.insert(tool_use_id.to_string());
            self.used_tool = true;
            let index = self.next_index;
            self.next_index += 1;
            self.open_block = OpenBlock::Tool {
                index,
                tool_use_id: tool_use_id.to_string(),
                name: name.to_string(),
            };
            self.current_tool_input.clear();
            out.extend(self.sink.tool_block_start(index, tool_use_id, name));
        }

        if let OpenBlock::Tool { index, name, .. } = &self.open_block {
            let index = *index;
            let name = name.clone();
            if let Some(fragment) = input {
                self.current_tool_input.push_str(fragment);
                out.extend(self.sink.tool_input_delta(index, fragment));
            }
            if stop {
                let full_input = std::mem::take(&mut self.current_tool_input);
                self.emitted_call_keys.insert(call_key(&name, &full_input));
                self.completed_tool_inputs.push(full_input);
                out.extend(self.sink.block_stop(index));
                self.open_block = OpenBlock::None;
            }
        }

        out
    }

    fn close_open_block(&mut self) -> Vec<Bytes> {
        match std::mem::replace(&mut self.open_block, OpenBlock::None) {
            OpenBlock::None => Vec::new(),
            OpenBlock::Text(index) => self.sink.block_stop(index),
            OpenBlock::Tool { index, name, .. } => {
                let full_input = std::mem::take(&mut self.current_tool_input);
                self.emitted_call_keys.insert(call_key(&name, &full_input));
                self.completed_tool_inputs.push(full_input);
                self.sink.block_stop(index)
            }
        }
    }

    /// Stream-end pass over everything that went out as text: bracket
    /// calls become structured tool blocks unless an identical structured
    /// call was already emitted.
    fn rescue_brackets(&mut self) -> Vec<Bytes> {
        if !self.emitted_text.contains("[Called") {
            return Vec::new();
        }

        let (_, calls) = extract_bracket_calls(&self.emitted_text);
        let mut out = Vec::new();

        for call in calls {
            let key = call_key(&call.function.name, &call.function.arguments);
            if !self.emitted_call_keys.insert(key) {
                tracing::info!(
                    "Skipping bracket call already emitted as structured: {}",
                    call.function.name
                );
                continue;
            }

            tracing::info!("Rescued bracket tool call: {}", call.function.name);
            self.used_tool = true;
            let index = self.next_index;
            self.next_index += 1;
            out.extend(
                self.sink
                    .tool_block_start(index, &call.id, &call.function.name),
            );
            out.extend(self.sink.tool_input_delta(index, &call.function.arguments));
            out.extend(self.sink.block_stop(index));
            self.completed_tool_inputs.push(call.function.arguments);
        }
        out
    }
}
