//! Typed stream of agent subprocess messages.
//!
//! The SDK adapter emits newline-delimited JSON in the stream-json format;
//! each line deserializes into one [`AgentMessage`]. The terminal message is
//! the `Result` variant, discriminated strictly by its tag — never by
//! attribute sniffing. `is_error` is an `Option<bool>` so "unknown" stays
//! distinguishable from "present but false".

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Assistant turn with content blocks (text, thinking, tool use).
    Assistant {
        #[serde(default)]
        content: Vec<ContentBlock>,
    },
    /// Free-form progress notification.
    Progress {
        #[serde(default)]
        content: String,
    },
    /// System/bookkeeping message from the agent harness.
    System {
        #[serde(default)]
        subtype: String,
    },
    /// Exactly one per execution; carries the structured result.
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        result: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },
}

impl AgentMessage {
    /// Terminal-by-tag: only the `Result` variant ends an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    /// Tool-use blocks inside an assistant turn.
    pub fn tool_uses(&self) -> Vec<(&str, &Value)> {
        match self {
            Self::Assistant { content } => content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, input, .. } => Some((name.as_str(), input)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Thinking text inside an assistant turn, concatenated.
    pub fn thinking_text(&self) -> Option<String> {
        match self {
            Self::Assistant { content } => {
                let text: Vec<&str> = content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
                        _ => None,
                    })
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join("\n"))
                }
            }
            _ => None,
        }
    }
}

/// Parse one stream-json line. Unparseable lines (plain text a subprocess
/// interleaves on stdout) degrade to `Progress`.
pub fn parse_stream_line(line: &str) -> Option<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        if let Ok(message) = serde_json::from_str::<AgentMessage>(trimmed) {
            return Some(message);
        }
    }
    Some(AgentMessage::Progress {
        content: trimmed.to_string(),
    })
}

/// One-line human label for a tool use, shown on the console.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path("file_path")),
        "Write" => format!("Creating: {}", path("file_path")),
        "Edit" => format!("Editing: {}", path("file_path")),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {cmd}")
        }
        "Glob" | "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Searching: {pattern}")
        }
        other => other.to_string(),
    }
}

/// Last two path components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i <= max_len - 3)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_message() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":{"success":true,"changes_made":true}}"#;
        let message = parse_stream_line(line).unwrap();
        assert!(message.is_terminal());
        match message {
            AgentMessage::Result {
                is_error, result, ..
            } => {
                assert_eq!(is_error, Some(false));
                assert!(result.unwrap().get("changes_made").unwrap().as_bool().unwrap());
            }
            _ => panic!("Expected Result"),
        }
    }

    #[test]
    fn test_is_error_absent_stays_unknown() {
        let line = r#"{"type":"result","subtype":"success"}"#;
        let message = parse_stream_line(line).unwrap();
        match message {
            AgentMessage::Result { is_error, .. } => assert_eq!(is_error, None),
            _ => panic!("Expected Result"),
        }
    }

    #[test]
    fn test_parse_assistant_tool_use() {
        let line = r#"{"type":"assistant","content":[{"type":"tool_use","name":"Edit","input":{"file_path":"/w/src/main.rs"},"id":"t1"}]}"#;
        let message = parse_stream_line(line).unwrap();
        assert!(!message.is_terminal());
        let uses = message.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "Edit");
    }

    #[test]
    fn test_parse_assistant_thinking() {
        let line = r#"{"type":"assistant","content":[{"type":"thinking","thinking":"check the retry loop"},{"type":"text","text":"ok"}]}"#;
        let message = parse_stream_line(line).unwrap();
        assert_eq!(message.thinking_text().as_deref(), Some("check the retry loop"));
    }

    #[test]
    fn test_plain_text_degrades_to_progress() {
        let message = parse_stream_line("Analyzing the codebase structure...").unwrap();
        match message {
            AgentMessage::Progress { content } => {
                assert_eq!(content, "Analyzing the codebase structure...")
            }
            _ => panic!("Expected Progress"),
        }
        assert!(parse_stream_line("   ").is_none());
    }

    #[test]
    fn test_malformed_json_degrades_to_progress() {
        let message = parse_stream_line("{truncated json").unwrap();
        assert!(!message.is_terminal());
    }

    #[test]
    fn test_terminal_detection_is_by_tag_not_fields() {
        // A non-result message that happens to carry result-looking fields
        // must not be terminal.
        let line = r#"{"type":"progress","content":"{\"is_error\":false}"}"#;
        let message = parse_stream_line(line).unwrap();
        assert!(!message.is_terminal());
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/home/u/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(describe_tool_use("Bash", &input), "Running: cargo test --release");

        let input = serde_json::json!({});
        assert_eq!(describe_tool_use("CustomTool", &input), "CustomTool");
    }

    #[test]
    fn test_message_serde_round_trip() {
        let message = AgentMessage::Result {
            subtype: "success".into(),
            is_error: Some(false),
            result: Some(serde_json::json!({"success": true})),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert!(back.is_terminal());
    }
}
