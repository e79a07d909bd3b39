//! Tool-call protocol: extracts and validates one structured invocation from
//! raw model output.
//!
//! The calling convention is a single JSON object, bare or inside a fenced
//! block:
//!
//! ```json
//! { "tool": "list_directory", "parameters": { "path": "." }, "continue": true }
//! ```
//!
//! The parser is stateless; retry policy for malformed output belongs to the
//! agent loop.

use serde_json::Value;

use crate::message::{MessageContent, Plan, Question, ToolInvocation};

/// Outcome of scanning one model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// No invocation structure was found.
    PlainText(String),
    Invocation(ToolInvocation),
    /// An invocation was attempted but is unusable.
    MalformedInvocation(String),
}

/// Scan `raw` for a single tool invocation.
pub fn parse(raw: &str) -> ParseOutcome {
    let mut attempts: Vec<Result<ToolInvocation, String>> = Vec::new();

    for candidate in candidates(raw) {
        match serde_json::from_str::<Value>(candidate.trim()) {
            Ok(Value::Object(map)) => {
                if map.contains_key("tool") {
                    attempts.push(validate(&map));
                } else if map.contains_key("parameters") || map.contains_key("continue") {
                    attempts.push(Err("missing required field 'tool'".to_string()));
                }
            }
            Ok(_) => {}
            Err(e) => {
                if candidate.contains("\"tool\"") {
                    attempts.push(Err(format!("invalid JSON: {e}")));
                }
            }
        }
    }

    match attempts.len() {
        0 => ParseOutcome::PlainText(raw.to_string()),
        1 => match attempts.remove(0) {
            Ok(invocation) => ParseOutcome::Invocation(invocation),
            Err(reason) => ParseOutcome::MalformedInvocation(reason),
        },
        n => ParseOutcome::MalformedInvocation(format!(
            "found {n} tool invocations; exactly one is allowed per turn"
        )),
    }
}

fn validate(map: &serde_json::Map<String, Value>) -> Result<ToolInvocation, String> {
    let tool = match map.get("tool") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return Err("'tool' must be a non-empty string".to_string()),
    };

    let params = match map.get("parameters").or_else(|| map.get("params")) {
        Some(Value::Object(params)) => params.clone(),
        Some(_) => return Err("'parameters' must be a JSON object".to_string()),
        None => return Err("missing required field 'parameters'".to_string()),
    };

    let continue_loop = match map.get("continue") {
        Some(Value::Bool(flag)) => *flag,
        Some(_) => return Err("'continue' must be the boolean true or false".to_string()),
        None => return Err("missing required field 'continue'".to_string()),
    };

    Ok(ToolInvocation::new(tool, params, continue_loop))
}

/// JSON-looking regions of `raw`: fenced blocks first, else the outermost braces.
fn candidates(raw: &str) -> Vec<&str> {
    let fenced: Vec<&str> = raw
        .split("```")
        .skip(1)
        .step_by(2)
        .map(strip_language_tag)
        .filter(|block| block.trim_start().starts_with('{'))
        .collect();
    if !fenced.is_empty() {
        return fenced;
    }

    let Some(start) = raw.find('{') else {
        return Vec::new();
    };
    match raw.rfind('}') {
        Some(end) if end > start => vec![&raw[start..=end]],
        _ => vec![&raw[start..]],
    }
}

fn strip_language_tag(block: &str) -> &str {
    match block.find('\n') {
        Some(newline) if !block[..newline].trim_start().starts_with('{') => &block[newline + 1..],
        _ => block,
    }
}

/// Recognize a plan or question payload in a plain-text response.
pub fn structured_content(raw: &str) -> Option<MessageContent> {
    for candidate in candidates(raw) {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate.trim()) else {
            continue;
        };
        let value = Value::Object(map);
        match value.get("type").and_then(Value::as_str) {
            Some("plan") => {
                if let Ok(plan) = serde_json::from_value::<Plan>(value.clone()) {
                    return Some(MessageContent::Plan { plan });
                }
            }
            Some("question") => {
                if let Ok(question) = serde_json::from_value::<Question>(value.clone()) {
                    return Some(MessageContent::Question { question });
                }
            }
            _ => {}
        }
    }
    None
}

/// Instruction sent back to the model after a malformed invocation.
pub fn corrective_instruction(reason: &str) -> String {
    format!(
        "Your last response contained a tool call that could not be used ({reason}). \
         Respond with exactly one JSON object in this format:\n\n\
         ```json\n\
         {{\n  \"tool\": \"tool_name\",\n  \"parameters\": {{ \"param\": \"value\" }},\n  \"continue\": true\n}}\n\
         ```\n\n\
         Set \"continue\" to false when this is the final step, or reply with plain text if no tool is needed."
    )
}

/// Feedback attached to a failed tool result so the model can adapt.
pub fn tool_failure_feedback(tool: &str, reason: &str) -> String {
    format!(
        "Tool '{tool}' failed: {reason}\n\n\
         Retry with different parameters, change approach, or set \"continue\" to false to stop."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_invocation(raw: &str) -> ToolInvocation {
        match parse(raw) {
            ParseOutcome::Invocation(inv) => inv,
            other => panic!("expected invocation, got {other:?}"),
        }
    }

    fn expect_malformed(raw: &str) -> String {
        match parse(raw) {
            ParseOutcome::MalformedInvocation(reason) => reason,
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_invocation() {
        let inv = expect_invocation(
            r#"{"tool": "list_directory", "parameters": {"path": "."}, "continue": true}"#,
        );
        assert_eq!(inv.tool, "list_directory");
        assert_eq!(inv.params["path"], ".");
        assert!(inv.continue_loop);
    }

    #[test]
    fn test_fenced_invocation_with_prose() {
        let raw = "I'll read the file:\n\n```json\n{\"tool\": \"read_file\", \"parameters\": {\"path\": \"a.txt\"}, \"continue\": false}\n```\n";
        let inv = expect_invocation(raw);
        assert_eq!(inv.tool, "read_file");
        assert!(!inv.continue_loop);
    }

    #[test]
    fn test_empty_parameters_allowed() {
        let inv = expect_invocation(r#"{"tool": "status", "parameters": {}, "continue": false}"#);
        assert!(inv.params.is_empty());
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            parse("Found 3 files."),
            ParseOutcome::PlainText("Found 3 files.".into())
        );
    }

    #[test]
    fn test_unrelated_json_is_plain_text() {
        let raw = "Here is the config: {\"port\": 8080}";
        assert!(matches!(parse(raw), ParseOutcome::PlainText(_)));
    }

    #[test]
    fn test_broken_json_is_malformed() {
        let reason = expect_malformed(r#"{"tool": "read_file", "parameters": {"path": "a"#);
        assert!(reason.starts_with("invalid JSON"));
    }

    #[test]
    fn test_empty_tool_name() {
        let reason = expect_malformed(r#"{"tool": "  ", "parameters": {}, "continue": true}"#);
        assert!(reason.contains("non-empty"));
    }

    #[test]
    fn test_continue_must_be_boolean() {
        let reason = expect_malformed(r#"{"tool": "x", "parameters": {}, "continue": "yes"}"#);
        assert!(reason.contains("boolean"));
        let reason = expect_malformed(r#"{"tool": "x", "parameters": {}}"#);
        assert!(reason.contains("'continue'"));
    }

    #[test]
    fn test_parameters_must_be_object() {
        let reason = expect_malformed(r#"{"tool": "x", "parameters": [1, 2], "continue": true}"#);
        assert!(reason.contains("JSON object"));
    }

    #[test]
    fn test_missing_tool_field() {
        let reason = expect_malformed(r#"{"parameters": {}, "continue": true}"#);
        assert!(reason.contains("'tool'"));
    }

    #[test]
    fn test_multiple_invocations_rejected() {
        let raw = "```json\n{\"tool\": \"a\", \"parameters\": {}, \"continue\": true}\n```\nthen\n```json\n{\"tool\": \"b\", \"parameters\": {}, \"continue\": false}\n```";
        let reason = expect_malformed(raw);
        assert!(reason.contains("exactly one"));
    }

    #[test]
    fn test_structured_plan() {
        let raw = r#"{"type": "plan", "goal": "Ship it", "steps": [{"description": "test"}]}"#;
        match structured_content(raw) {
            Some(MessageContent::Plan { plan }) => {
                assert_eq!(plan.goal, "Ship it");
                assert_eq!(plan.steps.len(), 1);
            }
            other => panic!("expected plan, got {other:?}"),
        }
        assert!(matches!(parse(raw), ParseOutcome::PlainText(_)));
    }

    #[test]
    fn test_structured_question() {
        let raw = "```json\n{\"type\": \"question\", \"question\": \"Which file?\", \"options\": [\"a\", \"b\"]}\n```";
        assert!(matches!(
            structured_content(raw),
            Some(MessageContent::Question { .. })
        ));
        assert!(structured_content("no payload").is_none());
    }

    #[test]
    fn test_corrective_instruction_mentions_reason() {
        let text = corrective_instruction("invalid JSON");
        assert!(text.contains("invalid JSON"));
        assert!(text.contains("\"continue\""));
    }
}
