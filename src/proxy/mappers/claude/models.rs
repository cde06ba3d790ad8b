// Claude-dialect data model. This is also the gateway's internal message
// model: the OpenAI dialect is normalised into these types before
// translation.

use serde::{Deserialize, Serialize};

/// Claude API request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// System prompt: plain string or list of text blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Flatten to plain text; non-text blocks are ignored.
    pub fn as_text(&self) -> String {
        match self {
            SystemPrompt::String(s) => s.clone(),
            SystemPrompt::Array(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::String(s) => s.clone(),
            MessageContent::Array(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::String(_) => &[],
            MessageContent::Array(blocks) => blocks,
        }
    }
}

/// Content block. Unknown variants are a deserialization error, not a
/// silent coercion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image { source: ImageSource },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        // String or array of blocks; normalised during translation.
        content: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_and_block_content() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4.5",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "user", "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}}
                ]}
            ]
        }))
        .unwrap();

        assert!(req.stream, "stream defaults on");
        assert_eq!(req.messages[0].content.text(), "hi");
        assert_eq!(req.messages[1].content.blocks().len(), 2);
    }

    #[test]
    fn test_unknown_block_type_rejected() {
        let result: Result<Message, _> = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "hologram", "data": "??"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_system_prompt_forms() {
        let s: SystemPrompt = serde_json::from_value(json!("be brief")).unwrap();
        assert_eq!(s.as_text(), "be brief");

        let s: SystemPrompt = serde_json::from_value(json!([
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]))
        .unwrap();
        assert_eq!(s.as_text(), "a\nb");
    }

    #[test]
    fn test_tool_result_content_forms() {
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "tool_result",
            "tool_use_id": "t1",
            "content": [{"type": "text", "text": "ok"}]
        }))
        .unwrap();
        match block {
            ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "t1"),
            _ => panic!("wrong variant"),
        }
    }
}
