use once_cell::sync::Lazy;
use regex::Regex;

use crate::proxy::mappers::claude::models::{ClaudeRequest, ContentBlock, MessageContent};

/// Count tokens with the cl100k_base BPE; `approximate_tokens` is the
/// documented fallback when no tokenizer is usable for the text.
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let bpe = tiktoken_rs::cl100k_base_singleton();
    let count = bpe.encode_with_special_tokens(text).len();
    if count == 0 {
        return approximate_tokens(text);
    }
    count as u32
}

/// ~4 characters per token, never zero for non-empty text.
pub fn approximate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    std::cmp::max(1, text.len() / 4) as u32
}

/// Whether the model matches a zero-input-token keyword as a whole word
/// (`-`/`_` boundaries), e.g. keyword `haiku` matches `claude-haiku-4.5`
/// but not `haikuish-model`.
pub fn is_zero_input_token_model(model: &str, keywords: &[String]) -> bool {
    static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_]").unwrap());

    let model = model.to_lowercase();
    let words: Vec<&str> = SEPARATOR.split(&model).collect();
    keywords
        .iter()
        .any(|kw| words.iter().any(|w| *w == kw.as_str()))
}

/// Estimate input tokens from the full request: system prompt, every
/// message's text, tool uses and results, and the tool declarations.
pub fn estimate_input_tokens(request: &ClaudeRequest) -> u32 {
    let mut parts: Vec<String> = Vec::new();

    if let Some(system) = &request.system {
        parts.push(system.as_text());
    }

    for message in &request.messages {
        match &message.content {
            MessageContent::String(s) => parts.push(s.clone()),
            MessageContent::Array(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(text.clone()),
                        ContentBlock::ToolUse { name, input, .. } => {
                            parts.push(name.clone());
                            parts.push(input.to_string());
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            match content {
                                serde_json::Value::String(s) => parts.push(s.clone()),
                                serde_json::Value::Array(items) => {
                                    for item in items {
                                        if let Some(text) =
                                            item.get("text").and_then(|t| t.as_str())
                                        {
                                            parts.push(text.to_string());
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                        ContentBlock::Image { .. } => {}
                    }
                }
            }
        }
    }

    if let Some(tools) = &request.tools {
        for tool in tools {
            parts.push(tool.name.clone());
            parts.push(tool.description.clone());
            parts.push(tool.input_schema.to_string());
        }
    }

    count_tokens(&parts.join("\n"))
}
