// Parser for the legacy inline tool-call encoding some upstream turns emit
// as plain text:
//
//   [Called <name> with args: {"key": "value"}]
//
// The arguments JSON is frequently mangled (truncated, unbalanced), so a
// repair pass runs before giving up on a call.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use super::models::{ToolCall, ToolCallFunction};

static CALL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[Called\s+(\w+)\s+with\s+args:").unwrap());

/// Find the `]` closing the bracket at `start`, honouring nesting and
/// brackets inside JSON strings.
fn find_matching_bracket(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'[') {
        return None;
    }

    let mut depth = 1usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, &byte) in bytes.iter().enumerate().skip(start + 1) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort JSON recovery: exact parse, then brace slicing, then
/// closing whatever was left open.
fn repair_json(candidate: &str) -> Option<Value> {
    let candidate = candidate.trim();
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }

    let start = candidate.find('{')?;
    let end = candidate.rfind('}');
    if let Some(end) = end {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&candidate[start..=end]) {
                return Some(value);
            }
        }
    }

    // Close unterminated strings and unbalanced braces.
    let core = &candidate[start..];
    let mut repaired = core.trim_end_matches(|c: char| c == ',' || c.is_whitespace()).to_string();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for c in repaired.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    if in_string {
        repaired.push('"');
    }
    for _ in 0..depth {
        repaired.push('}');
    }

    serde_json::from_str::<Value>(&repaired).ok()
}

fn parse_single(call_text: &str) -> Option<ToolCall> {
    let name = CALL_NAME.captures(call_text)?.get(1)?.as_str().to_string();

    let marker = "with args:";
    let args_start = call_text.to_lowercase().find(marker)? + marker.len();
    let args_end = call_text.rfind(']')?;
    if args_end <= args_start {
        return None;
    }

    let parsed = repair_json(&call_text[args_start..args_end])?;

    // A list wrapper around the argument object also occurs in the wild.
    let arguments = match parsed {
        Value::Object(map) => Value::Object(map),
        Value::Array(items) => items.into_iter().find(|v| v.is_object())?,
        _ => return None,
    };

    Some(ToolCall {
        id: format!("call_{}", &Uuid::new_v4().simple().to_string()[..8]),
        call_type: "function".to_string(),
        function: ToolCallFunction {
            name,
            arguments: arguments.to_string(),
        },
    })
}

/// Extract every bracket-format call from `text`, returning the calls and
/// the text with call spans removed.
pub fn extract_bracket_calls(text: &str) -> (String, Vec<ToolCall>) {
    if !text.contains("[Called") {
        return (text.to_string(), Vec::new());
    }

    let mut calls = Vec::new();
    let mut clean = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(rel) = text[cursor..].find("[Called") {
        let start = cursor + rel;
        clean.push_str(&text[cursor..start]);

        let end = match find_matching_bracket(text, start) {
            Some(end) => end,
            None => match text[start..].rfind(']') {
                Some(rel_end) => start + rel_end,
                None => {
                    tracing::warn!("Unterminated bracket call, keeping raw text");
                    clean.push_str(&text[start..]);
                    cursor = text.len();
                    break;
                }
            },
        };

        let call_text = &text[start..=end];
        match parse_single(call_text) {
            Some(call) => calls.push(call),
            None => {
                tracing::warn!("Failed to parse bracket call: {:.80}", call_text);
                clean.push_str(call_text);
            }
        }
        cursor = end + 1;
    }
    clean.push_str(&text[cursor..]);

    (clean.trim().to_string(), deduplicate_tool_calls(calls))
}

/// Drop repeats keyed by (name, arguments); ids differ per occurrence and
/// do not participate.
pub fn deduplicate_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut unique = Vec::new();

    for call in calls {
        let key = (call.function.name.clone(), call.function.arguments.clone());
        if seen.insert(key) {
            unique.push(call);
        } else {
            tracing::info!("Skipping duplicate tool call: {}", call.function.name);
        }
    }

    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_call_extracted() {
        let (clean, calls) =
            extract_bracket_calls(r#"Sure. [Called search with args: {"q": "dogs"}] Done."#);

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search");
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["q"], "dogs");
        assert_eq!(clean, "Sure.  Done.");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_nested_brackets_inside_strings() {
        let (_, calls) = extract_bracket_calls(
            r#"[Called edit with args: {"text": "see [1] and [2]", "count": 2}]"#,
        );
        assert_eq!(calls.len(), 1);
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["text"], "see [1] and [2]");
    }

    #[test]
    fn test_multiple_calls() {
        let (_, calls) = extract_bracket_calls(
            r#"[Called a with args: {"x": 1}] then [Called b with args: {"y": 2}]"#,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "a");
        assert_eq!(calls[1].function.name, "b");
    }

    #[test]
    fn test_truncated_json_repaired() {
        let (_, calls) =
            extract_bracket_calls(r#"[Called run with args: {"cmd": "ls", "flags": "-la]"#);
        assert_eq!(calls.len(), 1);
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["cmd"], "ls");
    }

    #[test]
    fn test_list_wrapped_arguments() {
        let (_, calls) = extract_bracket_calls(r#"[Called go with args: [{"a": 1}]]"#);
        assert_eq!(calls.len(), 1);
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["a"], 1);
    }

    #[test]
    fn test_no_calls_passthrough() {
        let input = "Plain text with [brackets] but no calls.";
        let (clean, calls) = extract_bracket_calls(input);
        assert!(calls.is_empty());
        assert_eq!(clean, input);
    }

    #[test]
    fn test_deduplication_by_name_and_args() {
        let (_, calls) = extract_bracket_calls(
            r#"[Called search with args: {"q": "x"}] [Called search with args: {"q": "x"}] [Called search with args: {"q": "y"}]"#,
        );
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_unparseable_call_left_in_text() {
        let input = "[Called with no name]";
        let (clean, calls) = extract_bracket_calls(input);
        assert!(calls.is_empty());
        assert_eq!(clean, input);
    }
}
