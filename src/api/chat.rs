//! Chat/completions body inspection and mutation.
//!
//! Bodies are peeked as loose JSON values rather than deserialized into a
//! schema: only the model name, the system messages, and two injected
//! fields ever matter, and everything else must round-trip untouched.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Grammar constraint injected for agentic coding clients, which expect
/// channel-delimited output from Harmony-style models.
pub const CLINE_GBNF: &str = r#"root ::= analysis? start final .+
analysis ::= "<|channel|>analysis<|message|>" ( [^<] | "<" [^|] | "<|" [^e] )* "<|end|>"
start ::= "<|start|>assistant"
final ::= "<|channel|>final<|message|>""#;

/// System prompt prefixes that trigger the grammar injection.
const AGENT_PREAMBLES: [&str; 2] = ["You are Cline", "You are Roo"];

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // The client convention writes the user's name into the system
        // prompt in Japanese, with several quote styles in the wild.
        Regex::new(r#"ユーザーの名前は[「『“"']([^」』”"']+)[」』”"']"#)
            .expect("username pattern must compile")
    })
}

/// The request's model name, when present and non-empty.
pub fn extract_model(body: &Value) -> Option<&str> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
}

/// Scan system messages for the username convention; first hit wins.
pub fn extract_username(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("system") {
            continue;
        }
        let text = joined_text(message);
        if text.is_empty() {
            continue;
        }
        if let Some(captures) = username_pattern().captures(&text) {
            let username = captures[1].trim();
            if !username.is_empty() {
                return Some(username.to_string());
            }
        }
    }
    None
}

/// Inject the grammar constraint when a system message opens with an agent
/// preamble. Returns whether the body was changed.
pub fn apply_grammar_hook(body: &mut Value) -> bool {
    let triggered = body
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|messages| messages.iter().any(has_agent_preamble));
    if !triggered {
        return false;
    }
    if let Some(object) = body.as_object_mut() {
        object.insert("reasoning_format".to_string(), Value::from("auto"));
        object.insert("grammar".to_string(), Value::from(CLINE_GBNF));
        return true;
    }
    false
}

fn has_agent_preamble(message: &Value) -> bool {
    if message.get("role").and_then(Value::as_str) != Some("system") {
        return false;
    }
    let text = leading_text(message);
    AGENT_PREAMBLES
        .iter()
        .any(|preamble| text.starts_with(preamble))
}

/// The probe text for the grammar hook: string content as-is, list content
/// contributes only its first part.
fn leading_text(message: &Value) -> &str {
    match message.get("content") {
        Some(Value::String(text)) => text,
        Some(Value::Array(parts)) => parts
            .first()
            .and_then(|part| part.get("text"))
            .and_then(Value::as_str)
            .unwrap_or(""),
        _ => "",
    }
}

/// Full message text for identity scanning: list content parts are joined
/// with newlines.
fn joined_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
