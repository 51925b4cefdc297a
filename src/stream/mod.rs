//! Helpers for the coding tool's `stream-json` output.
//!
//! The multiplexer treats every stdout line that parses as a JSON object as
//! a structured event. This module pulls the few things the orchestrator
//! cares about out of those objects: response text, the tool session id,
//! and a one-line summary for the job log.

use serde::Deserialize;
use serde_json::Value;

/// The subset of stream-json events with fields we read.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

fn typed(value: &Value) -> Option<StreamEvent> {
    StreamEvent::deserialize(value).ok()
}

/// Text to merge into the accumulated response: a top-level `text` string,
/// or the text blocks of an assistant message.
pub fn response_text(value: &Value) -> Option<String> {
    if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    match typed(value)? {
        StreamEvent::Assistant { message, .. } => {
            let text: String = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// The tool session id carried by an event, if any.
pub fn session_id(value: &Value) -> Option<&str> {
    value
        .get("session_id")
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
}

/// A short human-readable line for the job log.
pub fn summarize(value: &Value) -> Option<String> {
    match typed(value)? {
        StreamEvent::Assistant { message, .. } => {
            let parts: Vec<String> = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, input } => Some(describe_tool_use(name, input)),
                    ContentBlock::Text { text } => Some(truncate_str(first_line(text), 120)),
                    ContentBlock::Other => None,
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        StreamEvent::Result {
            subtype,
            result,
            is_error,
        } => {
            let label = if is_error { "Turn failed" } else { "Turn finished" };
            Some(match result {
                Some(r) if !r.is_empty() => {
                    format!("{} ({}): {}", label, subtype, truncate_str(first_line(&r), 120))
                }
                _ => format!("{} ({})", label, subtype),
            })
        }
        StreamEvent::System { subtype } => Some(format!("System: {}", subtype)),
    }
}

/// Describe a tool call in a few words.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" => format!("Reading: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Write" => format!("Creating: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Edit" => format!("Editing: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Bash" => format!("Running: {}", field("command").map(|c| truncate_str(c, 40)).unwrap_or_else(|| "command".into())),
        "Glob" => format!("Searching: {}", field("pattern").unwrap_or("*")),
        "Grep" => format!("Grep: {}", field("pattern").map(|p| truncate_str(p, 30)).unwrap_or_else(|| "pattern".into())),
        "Task" => format!("Agent: {}", field("description").unwrap_or("subagent")),
        _ => name.to_string(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text).trim()
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate on a char boundary, with ellipsis.
fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
