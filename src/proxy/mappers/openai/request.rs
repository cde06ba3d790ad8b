// OpenAI request -> internal Claude-model request.
//
// Normalising here means one request translator and one response
// translator serve both public dialects.

use serde_json::{json, Value};

use super::models::{OpenAiContent, OpenAiContentBlock, OpenAiRequest};
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::mappers::claude::models::{
    ClaudeRequest, ContentBlock, ImageSource, Message, MessageContent, SystemPrompt, Tool,
};

/// Parse a `data:image/...;base64,...` URI into an image block.
fn image_from_data_uri(url: &str) -> Option<ImageSource> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let media_type = header.split(';').next()?.to_string();
    if !media_type.starts_with("image/") {
        return None;
    }
    Some(ImageSource {
        source_type: "base64".to_string(),
        media_type,
        data: data.to_string(),
    })
}

fn convert_content(content: &OpenAiContent) -> Vec<ContentBlock> {
    match content {
        OpenAiContent::String(s) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text: s.clone() }]
            }
        }
        OpenAiContent::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                OpenAiContentBlock::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
                OpenAiContentBlock::ImageUrl { image_url } => {
                    match image_from_data_uri(&image_url.url) {
                        Some(source) => Some(ContentBlock::Image { source }),
                        None => {
                            tracing::warn!("Dropping non-data image URL");
                            None
                        }
                    }
                }
            })
            .collect(),
    }
}

/// Normalise an OpenAI chat request into the internal Claude shape.
pub fn to_claude_request(request: &OpenAiRequest) -> GatewayResult<ClaudeRequest> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for msg in &request.messages {
        match msg.role.as_str() {
            "system" => {
                let text = msg.content_text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => {
                let blocks = msg
                    .content
                    .as_ref()
                    .map(convert_content)
                    .unwrap_or_default();
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: "user".to_string(),
                        content: MessageContent::Array(blocks),
                    });
                }
            }
            "assistant" => {
                let mut blocks = msg
                    .content
                    .as_ref()
                    .map(convert_content)
                    .unwrap_or_default();

                if let Some(tool_calls) = &msg.tool_calls {
                    for call in tool_calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }

                if !blocks.is_empty() {
                    messages.push(Message {
                        role: "assistant".to_string(),
                        content: MessageContent::Array(blocks),
                    });
                }
            }
            "tool" | "function" => {
                let tool_use_id = msg
                    .tool_call_id
                    .clone()
                    .or_else(|| msg.name.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                messages.push(Message {
                    role: "user".to_string(),
                    content: MessageContent::Array(vec![ContentBlock::ToolResult {
                        tool_use_id,
                        content: json!(msg.content_text()),
                        status: None,
                        is_error: None,
                    }]),
                });
            }
            other => {
                tracing::warn!("Dropping message with unsupported role {:?}", other);
            }
        }
    }

    if messages.is_empty() {
        return Err(GatewayError::BadRequest(
            "no conversation messages found".to_string(),
        ));
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| Tool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t.function.parameters.clone(),
            })
            .collect::<Vec<_>>()
    });

    Ok(ClaudeRequest {
        model: request.model.clone(),
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(SystemPrompt::String(system_parts.join("\n\n")))
        },
        tools,
        stream: request.stream,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        metadata: None,
    })
}
