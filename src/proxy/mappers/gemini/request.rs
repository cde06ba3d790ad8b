// Claude request -> Gemini v1internal generateContent request.

use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::proxy::common::json_schema::clean_json_schema;
use crate::proxy::mappers::claude::models::{ClaudeRequest, ContentBlock, MessageContent, Tool};

/// Models the provider serves natively; these ids pass through unmapped.
const NATIVE_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.5-flash-thinking",
    "gemini-2.5-pro",
    "gemini-3-pro-low",
    "gemini-3-pro-high",
    "gemini-2.5-flash-lite",
    "gemini-2.5-flash-image",
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "gpt-oss-120b-medium",
];

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Map an incoming model id onto the Gemini Cloud Assist model set.
pub fn map_model(model: &str) -> String {
    if NATIVE_MODELS.contains(&model) {
        return model.to_string();
    }

    match model {
        "claude-sonnet-4.5" => "claude-sonnet-4-5",
        "claude-3-5-sonnet-20241022" => "claude-sonnet-4-5",
        "claude-3-5-sonnet-20240620" => "claude-sonnet-4-5",
        "claude-opus-4" => "gemini-3-pro-high",
        "claude-haiku-4" => "claude-haiku-4.5",
        "claude-3-haiku-20240307" => "gemini-2.5-flash",
        _ => DEFAULT_MODEL,
    }
    .to_string()
}

fn build_contents(request: &ClaudeRequest) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        let role = if message.role == "assistant" { "model" } else { "user" };
        let mut parts: Vec<Value> = Vec::new();

        match &message.content {
            MessageContent::String(text) => {
                if !text.trim().is_empty() && text != "(no content)" {
                    parts.push(json!({"text": text.trim()}));
                }
            }
            MessageContent::Array(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if text != "(no content)" {
                                parts.push(json!({"text": text}));
                            }
                        }
                        ContentBlock::Image { source } => {
                            if source.source_type == "base64" {
                                parts.push(json!({
                                    "inlineData": {
                                        "mimeType": source.media_type,
                                        "data": source.data,
                                    }
                                }));
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_id_to_name.insert(id.clone(), name.clone());
                            parts.push(json!({
                                "functionCall": {
                                    "name": name,
                                    "args": input,
                                    "id": id,
                                }
                            }));
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                            ..
                        } => {
                            let func_name = tool_id_to_name
                                .get(tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| tool_use_id.clone());

                            let mut merged = match content {
                                Value::String(s) => s.clone(),
                                Value::Array(items) => items
                                    .iter()
                                    .filter_map(|item| {
                                        item.get("text").and_then(|t| t.as_str())
                                    })
                                    .collect::<Vec<_>>()
                                    .join("\n"),
                                other => other.to_string(),
                            };

                            // An empty result reads as a hang to the model;
                            // substitute an explicit completion signal.
                            if merged.trim().is_empty() {
                                merged = if is_error.unwrap_or(false) {
                                    "Tool execution failed with no output.".to_string()
                                } else {
                                    "Command executed successfully.".to_string()
                                };
                            }

                            parts.push(json!({
                                "functionResponse": {
                                    "name": func_name,
                                    "response": {"result": merged},
                                    "id": tool_use_id,
                                }
                            }));
                        }
                    }
                }
            }
        }

        if parts.is_empty() {
            continue;
        }

        contents.push(json!({ "role": role, "parts": parts }));
    }

    Value::Array(contents)
}

fn build_tools(tools: &[Tool]) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }

    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let mut schema = tool.input_schema.clone();
            clean_json_schema(&mut schema);
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": schema,
            })
        })
        .collect();

    Some(json!([{ "functionDeclarations": declarations }]))
}

fn build_generation_config(request: &ClaudeRequest) -> Value {
    let mut config = json!({
        "maxOutputTokens": request.max_tokens.unwrap_or(64000),
        "stopSequences": ["<|user|>", "<|endoftext|>", "<|end_of_turn|>", "[DONE]", "\n\nHuman:"],
    });

    if let Some(temperature) = request.temperature {
        config["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        config["topP"] = json!(top_p);
    }
    if let Some(top_k) = request.top_k {
        config["topK"] = json!(top_k);
    }

    config
}

/// Transform a Claude-dialect request into the Gemini v1internal body.
pub fn transform_claude_request(
    request: &ClaudeRequest,
    project_id: &str,
) -> GatewayResult<Value> {
    let mut inner = json!({
        "contents": build_contents(request),
        "generationConfig": build_generation_config(request),
        "safetySettings": [
            { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "OFF" },
            { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "OFF" },
            { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "OFF" },
            { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "OFF" },
            { "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "OFF" },
        ],
    });

    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            inner["systemInstruction"] = json!({
                "role": "user",
                "parts": [{"text": text}],
            });
        }
    }

    if let Some(tools) = request.tools.as_deref().and_then(build_tools) {
        inner["tools"] = tools;
        inner["toolConfig"] = json!({
            "functionCallingConfig": { "mode": "VALIDATED" }
        });
    }

    if let Some(user_id) = request.metadata.as_ref().and_then(|m| m.user_id.as_ref()) {
        inner["sessionId"] = json!(user_id);
    }

    Ok(json!({
        "project": project_id,
        "requestId": format!("agent-{}", Uuid::new_v4()),
        "request": inner,
        "model": map_model(&request.model),
        "userAgent": "antigravity",
        "requestType": "agent",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: Value) -> ClaudeRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_model_mapping() {
        assert_eq!(map_model("gemini-2.5-pro"), "gemini-2.5-pro");
        assert_eq!(map_model("claude-sonnet-4-5"), "claude-sonnet-4-5");
        assert_eq!(map_model("claude-sonnet-4.5"), "claude-sonnet-4-5");
        assert_eq!(map_model("claude-opus-4"), "gemini-3-pro-high");
        assert_eq!(map_model("claude-3-haiku-20240307"), "gemini-2.5-flash");
        assert_eq!(map_model("totally-unknown"), "claude-sonnet-4-5");
    }

    #[test]
    fn test_basic_request_shape() {
        let req = request(json!({
            "model": "claude-sonnet-4.5",
            "system": "stay focused",
            "messages": [{"role": "user", "content": "hello"}],
            "temperature": 0.7
        }));

        let body = transform_claude_request(&req, "proj-1").unwrap();
        assert_eq!(body["project"], "proj-1");
        assert_eq!(body["model"], "claude-sonnet-4-5");
        assert_eq!(body["requestType"], "agent");
        assert!(body["requestId"].as_str().unwrap().starts_with("agent-"));

        let inner = &body["request"];
        assert_eq!(inner["contents"][0]["role"], "user");
        assert_eq!(inner["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(inner["systemInstruction"]["parts"][0]["text"], "stay focused");
        assert_eq!(inner["generationConfig"]["temperature"], 0.7);
        assert_eq!(inner["generationConfig"]["maxOutputTokens"], 64000);
    }

    #[test]
    fn test_tool_roundtrip_and_name_lookup() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "run ls"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "call_1", "name": "run_command", "input": {"command": "ls"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_1", "content": [
                        {"type": "text", "text": "file1.txt"},
                        {"type": "text", "text": "file2.txt"}
                    ]}
                ]}
            ]
        }));

        let body = transform_claude_request(&req, "p").unwrap();
        let contents = body["request"]["contents"].as_array().unwrap();

        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "run_command");

        let response = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "run_command");
        assert_eq!(response["id"], "call_1");
        let result = response["response"]["result"].as_str().unwrap();
        assert!(result.contains("file1.txt") && result.contains("file2.txt"));
    }

    #[test]
    fn test_empty_tool_result_substitution() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": ""},
                    {"type": "tool_result", "tool_use_id": "t2", "content": "", "is_error": true}
                ]}
            ]
        }));

        let body = transform_claude_request(&req, "p").unwrap();
        let parts = body["request"]["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(
            parts[0]["functionResponse"]["response"]["result"],
            "Command executed successfully."
        );
        assert_eq!(
            parts[1]["functionResponse"]["response"]["result"],
            "Tool execution failed with no output."
        );
    }

    #[test]
    fn test_tools_cleaned_and_tool_config_set() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{
                "name": "lookup",
                "description": "find things",
                "input_schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {"q": {"type": "string", "minLength": 1}}
                }
            }]
        }));

        let body = transform_claude_request(&req, "p").unwrap();
        let decl = &body["request"]["tools"][0]["functionDeclarations"][0];

        assert_eq!(decl["name"], "lookup");
        assert!(decl["parameters"].get("$schema").is_none());
        assert!(decl["parameters"]["properties"]["q"].get("minLength").is_none());
        assert_eq!(
            body["request"]["toolConfig"]["functionCallingConfig"]["mode"],
            "VALIDATED"
        );
    }

    #[test]
    fn test_image_block_becomes_inline_data() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "Zm9v"}}
            ]}]
        }));

        let body = transform_claude_request(&req, "p").unwrap();
        let part = &body["request"]["contents"][0]["parts"][0];
        assert_eq!(part["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(part["inlineData"]["data"], "Zm9v");
    }
}
