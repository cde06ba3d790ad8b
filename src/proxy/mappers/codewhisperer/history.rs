// Conversation-history normalisation for the CodeWhisperer wire format.
//
// The provider requires strict user/assistant alternation starting with a
// user entry and ending with an assistant entry. Client histories routinely
// violate this (consecutive user turns, orphaned assistant turns), so the
// history is repaired before it is sent.

use serde_json::{json, Value};

use crate::error::{GatewayError, GatewayResult};

pub const PLACEHOLDER_ASSISTANT: &str = "I understand.";
pub const PLACEHOLDER_USER: &str = "Continue";

fn is_user(entry: &Value) -> bool {
    entry.get("userInputMessage").is_some()
}

fn is_assistant(entry: &Value) -> bool {
    entry.get("assistantResponseMessage").is_some()
}

/// Collapse a run of consecutive userInputMessage entries into one.
///
/// Text contents are joined with a blank line; the first entry's context,
/// origin and modelId win; toolResults and images from every entry in the
/// run are carried over.
fn merge_user_entries(entries: &[Value]) -> Value {
    let mut contents: Vec<String> = Vec::new();
    let mut base_context: Option<Value> = None;
    let mut base_origin: Option<Value> = None;
    let mut base_model: Option<Value> = None;
    let mut tool_results: Vec<Value> = Vec::new();
    let mut images: Vec<Value> = Vec::new();

    for entry in entries {
        let Some(msg) = entry.get("userInputMessage") else {
            continue;
        };

        if let Some(content) = msg.get("content").and_then(|c| c.as_str()) {
            if !content.is_empty() {
                contents.push(content.to_string());
            }
        }

        if base_context.is_none() {
            base_context = msg.get("userInputMessageContext").cloned();
        }
        if base_origin.is_none() {
            base_origin = msg.get("origin").cloned();
        }
        if base_model.is_none() {
            base_model = msg.get("modelId").cloned();
        }

        if let Some(results) = msg
            .get("userInputMessageContext")
            .and_then(|c| c.get("toolResults"))
            .and_then(|t| t.as_array())
        {
            tool_results.extend(results.iter().cloned());
        }
        if let Some(imgs) = msg.get("images").and_then(|i| i.as_array()) {
            images.extend(imgs.iter().cloned());
        }
    }

    let mut context = base_context.unwrap_or_else(|| json!({}));
    if !tool_results.is_empty() {
        context["toolResults"] = Value::Array(merge_tool_results(tool_results));
    }

    let mut merged = json!({
        "content": contents.join("\n\n"),
        "userInputMessageContext": context,
        "origin": base_origin.unwrap_or_else(|| json!("CLI")),
    });
    if let Some(model) = base_model {
        merged["modelId"] = model;
    }
    if !images.is_empty() {
        merged["images"] = Value::Array(images);
    }

    json!({ "userInputMessage": merged })
}

/// De-duplicate tool results by toolUseId, concatenating the content lists
/// of duplicates so no id appears twice.
pub fn merge_tool_results(results: Vec<Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::new();

    for result in results {
        let id = result
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let existing = id.as_deref().and_then(|id| {
            merged
                .iter_mut()
                .find(|m| m.get("toolUseId").and_then(|v| v.as_str()) == Some(id))
        });

        match existing {
            Some(entry) => {
                tracing::info!(
                    "Merging duplicate toolUseId {}",
                    id.as_deref().unwrap_or("?")
                );
                let extra = result
                    .get("content")
                    .and_then(|c| c.as_array())
                    .cloned()
                    .unwrap_or_default();
                if let Some(content) = entry.get_mut("content").and_then(|c| c.as_array_mut()) {
                    content.extend(extra);
                } else {
                    entry["content"] = Value::Array(extra);
                }
            }
            None => merged.push(result),
        }
    }

    merged
}

/// Repair a CodeWhisperer history into strict alternation.
///
/// Consecutive user entries are merged; an unanswered user gets a
/// placeholder assistant reply; an orphaned assistant gets a placeholder
/// user turn before it. The result always ends on an assistant entry so the
/// current user message can follow.
pub fn normalize_history(history: Vec<Value>) -> GatewayResult<Vec<Value>> {
    if history.is_empty() {
        return Ok(history);
    }

    // Pass 1: collapse user runs.
    let mut collapsed: Vec<Value> = Vec::new();
    let mut pending_users: Vec<Value> = Vec::new();

    for entry in history {
        if is_user(&entry) {
            pending_users.push(entry);
        } else if is_assistant(&entry) {
            if !pending_users.is_empty() {
                collapsed.push(merge_user_entries(&pending_users));
                pending_users.clear();
            }
            collapsed.push(entry);
        }
        // Entries that are neither role are dropped.
    }
    if !pending_users.is_empty() {
        collapsed.push(merge_user_entries(&pending_users));
    }

    // Pass 2: fill role gaps with placeholders.
    let mut repaired: Vec<Value> = Vec::new();
    for entry in collapsed {
        if is_assistant(&entry) && !repaired.last().map(is_user).unwrap_or(false) {
            repaired.push(json!({
                "userInputMessage": {
                    "content": PLACEHOLDER_USER,
                    "userInputMessageContext": {},
                    "origin": "CLI",
                }
            }));
        }
        repaired.push(entry);
    }
    if repaired.last().map(is_user).unwrap_or(false) {
        repaired.push(json!({
            "assistantResponseMessage": { "content": PLACEHOLDER_ASSISTANT }
        }));
    }

    validate_alternation(&repaired)?;
    Ok(repaired)
}

/// Strict user/assistant alternation check; a violation here is a
/// translation bug, not a client error.
pub fn validate_alternation(history: &[Value]) -> GatewayResult<()> {
    let mut last_was_user: Option<bool> = None;

    for (idx, entry) in history.iter().enumerate() {
        let current_is_user = if is_user(entry) {
            true
        } else if is_assistant(entry) {
            false
        } else {
            return Err(GatewayError::Translation(format!(
                "history entry {} is neither user nor assistant",
                idx
            )));
        };

        if last_was_user == Some(current_is_user) {
            return Err(GatewayError::Translation(format!(
                "history entry {} repeats the {} role",
                idx,
                if current_is_user { "user" } else { "assistant" }
            )));
        }
        last_was_user = Some(current_is_user);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Value {
        json!({"userInputMessage": {"content": content, "userInputMessageContext": {}, "origin": "CLI"}})
    }

    fn assistant(content: &str) -> Value {
        json!({"assistantResponseMessage": {"content": content}})
    }

    #[test]
    fn test_consecutive_users_merged_with_blank_line() {
        let history = vec![user("a"), user("b"), assistant("c")];
        let normalized = normalize_history(history).unwrap();

        assert_eq!(normalized.len(), 2);
        assert_eq!(
            normalized[0]["userInputMessage"]["content"],
            "a\n\nb"
        );
        assert_eq!(normalized[1]["assistantResponseMessage"]["content"], "c");
    }

    #[test]
    fn test_trailing_user_gets_placeholder_assistant() {
        let history = vec![user("a"), assistant("b"), user("c")];
        let normalized = normalize_history(history).unwrap();

        assert_eq!(normalized.len(), 4);
        assert_eq!(
            normalized[3]["assistantResponseMessage"]["content"],
            PLACEHOLDER_ASSISTANT
        );
    }

    #[test]
    fn test_orphaned_assistant_gets_placeholder_user() {
        let history = vec![assistant("hello")];
        let normalized = normalize_history(history).unwrap();

        assert_eq!(normalized.len(), 2);
        assert_eq!(
            normalized[0]["userInputMessage"]["content"],
            PLACEHOLDER_USER
        );
    }

    #[test]
    fn test_consecutive_assistants_separated() {
        let history = vec![user("q"), assistant("a1"), assistant("a2")];
        let normalized = normalize_history(history).unwrap();

        assert_eq!(normalized.len(), 4);
        assert!(normalized[2].get("userInputMessage").is_some());
        validate_alternation(&normalized).unwrap();
    }

    #[test]
    fn test_merge_carries_tool_results_and_dedupes() {
        let u1 = json!({"userInputMessage": {
            "content": "",
            "userInputMessageContext": {"toolResults": [
                {"toolUseId": "t1", "content": [{"text": "part one"}], "status": "success"}
            ]},
            "origin": "CLI"
        }});
        let u2 = json!({"userInputMessage": {
            "content": "next",
            "userInputMessageContext": {"toolResults": [
                {"toolUseId": "t1", "content": [{"text": "part two"}], "status": "success"}
            ]},
            "origin": "CLI"
        }});

        let normalized = normalize_history(vec![u1, u2]).unwrap();
        let results = normalized[0]["userInputMessage"]["userInputMessageContext"]["toolResults"]
            .as_array()
            .unwrap();
        assert_eq!(results.len(), 1);
        let content = results[0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
    }

    #[test]
    fn test_validation_rejects_same_role_pairs() {
        let bad = vec![user("a"), user("b")];
        assert!(validate_alternation(&bad).is_err());

        let good = vec![user("a"), assistant("b"), user("c"), assistant("d")];
        validate_alternation(&good).unwrap();
    }

    #[test]
    fn test_empty_history_passes() {
        assert!(normalize_history(vec![]).unwrap().is_empty());
    }
}
