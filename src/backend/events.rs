//! Typed backend events.
//!
//! Backends stream loosely structured JSON lines. [`BackendEvent::from_json`]
//! is the single place where those payloads are interpreted; everything
//! downstream works with the closed enum.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool targets longer than this are truncated.
const MAX_TARGET_CHARS: usize = 50;

/// Argument containers searched for a tool target, in order.
const ARGUMENT_FIELDS: [&str; 3] = ["arguments", "input", "parameters"];

/// Argument keys that name what a tool acts on, in order of preference.
const TARGET_KEYS: [&str; 5] = ["file_path", "path", "filename", "file", "command"];

/// Event emitted by a backend while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendEvent {
    /// Model reasoning text.
    Reasoning { text: String },
    /// Complete assistant message.
    Message { text: String },
    /// Streaming text fragment.
    Delta { text: String },
    /// A tool invocation started.
    ToolCall {
        tool: String,
        target: Option<String>,
    },
    /// A tool invocation finished.
    ToolResult {
        tool: String,
        target: Option<String>,
    },
    /// Session lifecycle marker such as `thread.started`.
    Lifecycle { phase: String },
}

impl BackendEvent {
    /// Parses one JSON line. Blank or malformed lines yield `None`.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|value| Self::from_json(&value))
    }

    /// Interprets a raw backend payload.
    ///
    /// Returns `None` for payloads that carry nothing worth surfacing.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let kind = str_field(obj, "type")
            .or_else(|| str_field(obj, "event"))
            .unwrap_or_default();

        match kind {
            "item.completed" => obj.get("item")?.as_object().and_then(Self::from_item),
            "tool_use" => Some(Self::ToolCall {
                tool: tool_name(obj),
                target: tool_target(obj),
            }),
            "tool_result" => Some(Self::ToolResult {
                tool: tool_name(obj),
                target: tool_target(obj),
            }),
            "message" | "assistant" => message_text(obj).map(|text| Self::Message { text }),
            "content_block_delta" => obj
                .get("delta")
                .and_then(Value::as_object)
                .and_then(|delta| str_field(delta, "text"))
                .filter(|text| !text.is_empty())
                .map(|text| Self::Delta {
                    text: text.to_string(),
                }),
            k if k.starts_with("thread.") || k.starts_with("turn.") => Some(Self::Lifecycle {
                phase: k.to_string(),
            }),
            _ => message_text(obj).map(|text| Self::Message { text }),
        }
    }

    fn from_item(item: &Map<String, Value>) -> Option<Self> {
        match str_field(item, "type").unwrap_or_default() {
            "reasoning" => message_text(item).map(|text| Self::Reasoning { text }),
            "agent_message" | "message" => message_text(item).map(|text| Self::Message { text }),
            "tool_call" | "function_call" => Some(Self::ToolCall {
                tool: tool_name(item),
                target: tool_target(item),
            }),
            "command_execution" => Some(Self::ToolCall {
                tool: "shell".to_string(),
                target: str_field(item, "command").map(truncate_target),
            }),
            _ => message_text(item).map(|text| Self::Message { text }),
        }
    }

    /// Returns the text carried by text-bearing events.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Reasoning { text } | Self::Message { text } | Self::Delta { text } => {
                Some(text)
            }
            _ => None,
        }
    }

    /// Returns true for complete assistant messages.
    #[must_use]
    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

impl std::fmt::Display for BackendEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reasoning { text } => write!(f, "[thinking] {text}"),
            Self::Message { text } | Self::Delta { text } => f.write_str(text),
            Self::ToolCall { tool, target } => match target {
                Some(target) => write!(f, "-> {tool} {target}"),
                None => write!(f, "-> {tool}"),
            },
            Self::ToolResult { tool, .. } => write!(f, "<- {tool} done"),
            Self::Lifecycle { phase } => write!(f, "[{phase}]"),
        }
    }
}

/// Extracts the session id from a `thread.started` payload.
#[must_use]
pub fn thread_id(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    let kind = str_field(obj, "type").or_else(|| str_field(obj, "event"))?;
    if kind != "thread.started" {
        return None;
    }
    str_field(obj, "thread_id")
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Text from `content` (string or array of `{text}` parts), then `text`, then `message`.
fn message_text(obj: &Map<String, Value>) -> Option<String> {
    let text = match obj.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => text_from_parts(parts),
        _ => String::new(),
    };

    let text = if text.is_empty() {
        str_field(obj, "text")
            .or_else(|| str_field(obj, "message"))
            .unwrap_or_default()
            .to_string()
    } else {
        text
    };

    (!text.is_empty()).then_some(text)
}

fn text_from_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

fn tool_name(obj: &Map<String, Value>) -> String {
    str_field(obj, "name")
        .or_else(|| {
            obj.get("tool_use")
                .and_then(|nested| nested.get("name"))
                .and_then(Value::as_str)
        })
        .unwrap_or("unknown")
        .to_string()
}

fn tool_target(obj: &Map<String, Value>) -> Option<String> {
    ARGUMENT_FIELDS.iter().find_map(|field| {
        let args = match obj.get(*field)? {
            Value::Object(map) => map.clone(),
            // function_call items carry their arguments as a JSON string
            Value::String(raw) => serde_json::from_str::<Map<String, Value>>(raw).ok()?,
            _ => return None,
        };
        TARGET_KEYS
            .iter()
            .find_map(|key| args.get(*key).and_then(Value::as_str))
            .filter(|target| !target.is_empty())
            .map(truncate_target)
    })
}

fn truncate_target(target: &str) -> String {
    if target.chars().count() > MAX_TARGET_CHARS {
        let head: String = target.chars().take(MAX_TARGET_CHARS).collect();
        format!("{head}...")
    } else {
        target.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_object_is_ignored() {
        assert_eq!(BackendEvent::from_json(&Value::Null), None);
        assert_eq!(BackendEvent::from_json(&json!([1, 2])), None);
        assert_eq!(BackendEvent::parse_line("   "), None);
        assert_eq!(BackendEvent::parse_line("not json"), None);
    }

    #[test]
    fn test_message_content_string() {
        let event = BackendEvent::from_json(&json!({"type": "message", "content": "Hello world"}));
        assert_eq!(
            event,
            Some(BackendEvent::Message {
                text: "Hello world".into()
            })
        );
    }

    #[test]
    fn test_message_content_array() {
        let event = BackendEvent::from_json(&json!({
            "type": "message",
            "content": [{"text": "First part"}, {"image": "..."}, {"text": " Second part"}]
        }));
        assert_eq!(event.and_then(|e| e.text().map(String::from)).as_deref(), Some("First part Second part"));
    }

    #[test]
    fn test_unknown_type_falls_back_to_text_then_message() {
        let event = BackendEvent::from_json(&json!({"type": "some_other_type", "text": "Direct text"}));
        assert_eq!(
            event,
            Some(BackendEvent::Message {
                text: "Direct text".into()
            })
        );
        let event = BackendEvent::from_json(&json!({"type": "unknown", "message": "Fallback message"}));
        assert_eq!(
            event,
            Some(BackendEvent::Message {
                text: "Fallback message".into()
            })
        );
        assert_eq!(BackendEvent::from_json(&json!({"type": "noise"})), None);
    }

    #[test]
    fn test_content_block_delta() {
        let event = BackendEvent::from_json(&json!({
            "type": "content_block_delta",
            "delta": {"text": "Streaming text chunk"}
        }));
        assert_eq!(
            event,
            Some(BackendEvent::Delta {
                text: "Streaming text chunk".into()
            })
        );
    }

    #[test]
    fn test_tool_use_targets() {
        let event = BackendEvent::from_json(&json!({
            "type": "tool_use",
            "name": "Read",
            "arguments": {"file_path": "/path/to/file.go"}
        }));
        assert_eq!(
            event,
            Some(BackendEvent::ToolCall {
                tool: "Read".into(),
                target: Some("/path/to/file.go".into())
            })
        );

        let event = BackendEvent::from_json(&json!({
            "type": "tool_use",
            "name": "Write",
            "input": {"path": "/path/to/output.txt"}
        }));
        assert!(matches!(
            event,
            Some(BackendEvent::ToolCall { ref target, .. }) if target.as_deref() == Some("/path/to/output.txt")
        ));
    }

    #[test]
    fn test_tool_target_truncated() {
        let event = BackendEvent::from_json(&json!({
            "type": "tool_use",
            "name": "Bash",
            "arguments": {"command": "echo 'This is a very long command that exceeds fifty characters and should be truncated'"}
        }));
        assert_eq!(
            event,
            Some(BackendEvent::ToolCall {
                tool: "Bash".into(),
                target: Some("echo 'This is a very long command that exceeds fif...".into())
            })
        );
    }

    #[test]
    fn test_tool_target_key_preference() {
        let obj = json!({"parameters": {"command": "ls", "file_path": "/param/path"}});
        assert_eq!(
            tool_target(obj.as_object().unwrap()).as_deref(),
            Some("/param/path")
        );
        let obj = json!({"arguments": {"unrelated": "value"}});
        assert_eq!(tool_target(obj.as_object().unwrap()), None);
    }

    #[test]
    fn test_tool_target_from_string_arguments() {
        let obj = json!({"arguments": "{\"filename\": \"test.txt\"}"});
        assert_eq!(tool_target(obj.as_object().unwrap()).as_deref(), Some("test.txt"));
    }

    #[test]
    fn test_tool_result_names() {
        let event = BackendEvent::from_json(&json!({"type": "tool_result", "name": "Read"}));
        assert_eq!(
            event,
            Some(BackendEvent::ToolResult {
                tool: "Read".into(),
                target: None
            })
        );
        let event = BackendEvent::from_json(&json!({"type": "tool_result", "tool_use": {"name": "Write"}}));
        assert!(matches!(event, Some(BackendEvent::ToolResult { ref tool, .. }) if tool == "Write"));
    }

    #[test]
    fn test_item_completed_variants() {
        let reasoning = BackendEvent::from_json(&json!({
            "type": "item.completed",
            "item": {"type": "reasoning", "text": "Thinking about the problem..."}
        }));
        assert_eq!(
            reasoning,
            Some(BackendEvent::Reasoning {
                text: "Thinking about the problem...".into()
            })
        );

        let message = BackendEvent::from_json(&json!({
            "type": "item.completed",
            "item": {"type": "agent_message", "text": "Here is my response"}
        }));
        assert!(message.as_ref().is_some_and(BackendEvent::is_message));

        let call = BackendEvent::from_json(&json!({
            "type": "item.completed",
            "item": {"type": "function_call", "name": "Write", "arguments": {"file": "/output.txt"}}
        }));
        assert_eq!(
            call,
            Some(BackendEvent::ToolCall {
                tool: "Write".into(),
                target: Some("/output.txt".into())
            })
        );

        let shell = BackendEvent::from_json(&json!({
            "type": "item.completed",
            "item": {"type": "command_execution", "command": "cargo test"}
        }));
        assert_eq!(
            shell,
            Some(BackendEvent::ToolCall {
                tool: "shell".into(),
                target: Some("cargo test".into())
            })
        );
    }

    #[test]
    fn test_assistant_content() {
        let event = BackendEvent::from_json(&json!({
            "type": "assistant",
            "content": [{"text": "Assistant response"}]
        }));
        assert_eq!(
            event,
            Some(BackendEvent::Message {
                text: "Assistant response".into()
            })
        );
    }

    #[test]
    fn test_lifecycle_and_thread_id() {
        let raw = json!({"type": "thread.started", "thread_id": "abc-123"});
        assert_eq!(
            BackendEvent::from_json(&raw),
            Some(BackendEvent::Lifecycle {
                phase: "thread.started".into()
            })
        );
        assert_eq!(thread_id(&raw).as_deref(), Some("abc-123"));
        assert_eq!(thread_id(&json!({"event": "thread.started", "thread_id": "xyz"})).as_deref(), Some("xyz"));
        assert_eq!(thread_id(&json!({"type": "turn.started"})), None);
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let json = serde_json::to_value(BackendEvent::ToolCall {
            tool: "Read".into(),
            target: None,
        })
        .unwrap();
        assert_eq!(json["kind"], "tool_call");
        assert_eq!(json["tool"], "Read");
    }
}
