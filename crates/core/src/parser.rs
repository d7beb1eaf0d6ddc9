// crates/core/src/parser.rs
//! Parser for the agent's append-only session logs.
//!
//! One JSON object per line, discriminated by `type`. Lines that fail to
//! parse (including a half-written final line) are skipped. The result is a
//! historical [`Session`] snapshot, or `None` when no line names a working
//! directory.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ParseError;
use crate::protocol::MessageContent;
use crate::session::Session;
use crate::types::{ChatMessage, ModelInfo};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogLine {
    Session {
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ModelChange {
        provider: String,
        model_id: String,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ThinkingLevelChange {
        thinking_level: String,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    Message {
        message: LogMessage,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    // Older logs recorded tool traffic as separate lines.
    ToolUse,
    ToolResult,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct LogMessage {
    role: String,
    #[serde(default)]
    content: MessageContent,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Parse an ISO-8601 string or an epoch-milliseconds number.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

/// Session id from a `<timestamp>_<uuid>.jsonl` file name: the token after
/// the last `_` in the stem, or the whole stem when there is none.
pub fn session_id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let id = stem.rsplit_once('_').map_or(stem, |(_, id)| id);
    (!id.is_empty()).then(|| id.to_string())
}

/// Build a historical session from the raw bytes of its log file.
pub fn parse_session_bytes(path: &Path, bytes: &[u8]) -> Option<Session> {
    let id = session_id_from_path(path)?;

    let mut cwd: Option<String> = None;
    let mut model: Option<ModelInfo> = None;
    let mut thinking_level: Option<String> = None;
    let mut messages: Vec<ChatMessage> = Vec::new();
    let mut last_activity = DateTime::<Utc>::UNIX_EPOCH;
    let mut observe = |ts: Option<&Value>| {
        if let Some(ts) = ts.and_then(parse_timestamp) {
            if ts > last_activity {
                last_activity = ts;
            }
        }
    };

    for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let raw = raw.trim_ascii();
        if raw.is_empty() {
            continue;
        }
        let line: LogLine = match serde_json::from_slice(raw) {
            Ok(line) => line,
            Err(e) => {
                debug!(path = %path.display(), line = idx + 1, error = %e, "skipping unparseable log line");
                continue;
            }
        };

        match line {
            LogLine::Session {
                cwd: line_cwd,
                timestamp,
            } => {
                observe(timestamp.as_ref());
                if let Some(dir) = line_cwd.filter(|c| !c.is_empty()) {
                    cwd = Some(dir);
                }
            }
            LogLine::ModelChange {
                provider,
                model_id,
                timestamp,
            } => {
                observe(timestamp.as_ref());
                model = Some(ModelInfo::new(provider, model_id));
            }
            LogLine::ThinkingLevelChange {
                thinking_level: level,
                timestamp,
            } => {
                observe(timestamp.as_ref());
                thinking_level = Some(level);
            }
            LogLine::Message { message, timestamp } => {
                observe(timestamp.as_ref());
                observe(message.timestamp.as_ref());
                let ts = message
                    .timestamp
                    .as_ref()
                    .or(timestamp.as_ref())
                    .and_then(parse_timestamp);

                let mut chat = match message.role.as_str() {
                    "user" => ChatMessage::user(message.content.text()),
                    "assistant" => {
                        if let (Some(provider), Some(model_id)) = (message.provider, message.model)
                        {
                            model = Some(ModelInfo::new(provider, model_id));
                        }
                        ChatMessage::assistant(message.content.text())
                    }
                    _ => continue,
                };
                if chat.text.is_empty() {
                    continue;
                }
                chat.timestamp = ts;
                messages.push(chat);
            }
            LogLine::ToolUse | LogLine::ToolResult | LogLine::Other => {}
        }
    }

    let cwd = cwd?;
    let mut session = Session::historical(id, cwd, path);
    session.set_messages(messages);
    session.model = model;
    session.thinking_level = thinking_level;
    session.last_activity = last_activity;
    Some(session)
}

/// Read and parse one session log.
///
/// # Errors
/// - `ParseError::NotFound` if the file doesn't exist
/// - `ParseError::PermissionDenied` if the file can't be read
/// - `ParseError::Io` for other I/O errors
pub async fn parse_session_file(path: &Path) -> Result<Option<Session>, ParseError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ParseError::io(path, e))?;
    Ok(parse_session_bytes(path, &bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use pretty_assertions::assert_eq;

    const PATH: &str = "/s/--proj--/2025-01-01T10-00-00-000Z_0b9c1a2e-1111-2222-3333-444455556666.jsonl";

    #[test]
    fn test_session_id_from_path() {
        assert_eq!(
            session_id_from_path(Path::new(PATH)).as_deref(),
            Some("0b9c1a2e-1111-2222-3333-444455556666")
        );
        assert_eq!(
            session_id_from_path(Path::new("/s/p/plain.jsonl")).as_deref(),
            Some("plain")
        );
        assert_eq!(session_id_from_path(Path::new("/s/p/trailing_.jsonl")), None);
    }

    #[test]
    fn test_basic_scenario() {
        let bytes = br#"{"type":"session","cwd":"/proj"}
{"type":"message","message":{"role":"user","content":"hi"}}
{"type":"message","message":{"role":"assistant","content":[{"type":"text","text":"hello"}]}}
"#;
        let session = parse_session_bytes(Path::new(PATH), bytes).unwrap();
        assert_eq!(session.working_directory, Path::new("/proj"));
        assert!(!session.is_live());
        assert_eq!(session.session_file.as_deref(), Some(Path::new(PATH)));
        let got: Vec<(Role, &str)> = session
            .messages
            .iter()
            .map(|m| (m.role, m.text.as_str()))
            .collect();
        assert_eq!(got, vec![(Role::User, "hi"), (Role::Assistant, "hello")]);
    }

    #[test]
    fn test_no_cwd_yields_none() {
        let bytes = br#"{"type":"message","message":{"role":"user","content":"hi"}}"#;
        assert!(parse_session_bytes(Path::new(PATH), bytes).is_none());
        assert!(parse_session_bytes(Path::new(PATH), b"").is_none());
        assert!(parse_session_bytes(Path::new(PATH), b"garbage\n{{{").is_none());
    }

    #[test]
    fn test_malformed_and_partial_lines_skipped() {
        let bytes = br#"{"type":"session","cwd":"/proj"}
not json at all
{"type":"message","message":{"role":"user","content":"one"}}
{"type":"message","message":{"role":"assistant","content":[{"type":"te"#;
        let session = parse_session_bytes(Path::new(PATH), bytes).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].text, "one");
    }

    #[test]
    fn test_only_text_blocks_extracted() {
        let bytes = br#"{"type":"session","cwd":"/proj"}
{"type":"message","message":{"role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"a"},{"type":"toolCall","id":"c1","name":"bash","arguments":{}},{"type":"text","text":"b"}]}}
{"type":"message","message":{"role":"assistant","content":[{"type":"toolCall","id":"c2","name":"read","arguments":{}}]}}
{"type":"message","message":{"role":"toolResult","toolCallId":"c1","content":[{"type":"text","text":"out"}]}}
{"type":"tool_use","name":"bash"}
{"type":"tool_result","output":"x"}
"#;
        let session = parse_session_bytes(Path::new(PATH), bytes).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].text, "a\nb");
        assert!(session.messages[0].thinking.is_none());
    }

    #[test]
    fn test_model_and_thinking_level() {
        let bytes = br#"{"type":"session","cwd":"/proj"}
{"type":"model_change","provider":"anthropic","modelId":"claude-sonnet-4"}
{"type":"thinking_level_change","thinkingLevel":"high"}
"#;
        let session = parse_session_bytes(Path::new(PATH), bytes).unwrap();
        assert_eq!(
            session.model,
            Some(ModelInfo::new("anthropic", "claude-sonnet-4"))
        );
        assert_eq!(session.thinking_level.as_deref(), Some("high"));
        assert!(session.messages.is_empty());
    }

    #[test]
    fn test_last_activity_is_forward_only() {
        let bytes = br#"{"type":"session","cwd":"/proj","timestamp":"2025-01-01T10:00:00.000Z"}
{"type":"message","timestamp":"2025-01-01T10:05:00.500Z","message":{"role":"user","content":"later"}}
{"type":"message","message":{"role":"assistant","content":"earlier","timestamp":1735725600000}}
"#;
        let session = parse_session_bytes(Path::new(PATH), bytes).unwrap();
        let expected = DateTime::parse_from_rfc3339("2025-01-01T10:05:00.500Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(session.last_activity, expected);
        // Per-message timestamps still come from their own line.
        assert_eq!(
            session.messages[1].timestamp,
            DateTime::from_timestamp_millis(1_735_725_600_000)
        );
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let iso = parse_timestamp(&Value::String("2025-06-01T12:00:00.123Z".into())).unwrap();
        assert_eq!(iso.timestamp_millis(), 1_748_779_200_123);
        let ms = parse_timestamp(&serde_json::json!(1_748_779_200_123i64)).unwrap();
        assert_eq!(iso, ms);
        assert!(parse_timestamp(&Value::String("yesterday".into())).is_none());
        assert!(parse_timestamp(&Value::Bool(true)).is_none());
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let bytes = br#"{"type":"session","cwd":"/proj","timestamp":"2025-01-01T10:00:00Z"}
{"type":"model_change","provider":"openai","modelId":"gpt-5"}
{"type":"message","message":{"role":"user","content":"hi","timestamp":1735725700000}}
"#;
        let a = parse_session_bytes(Path::new(PATH), bytes).unwrap();
        let b = parse_session_bytes(Path::new(PATH), bytes).unwrap();
        assert_eq!(a.messages, b.messages);
        assert_eq!(a.model, b.model);
        assert_eq!(a.last_activity, b.last_activity);
    }

    #[tokio::test]
    async fn test_parse_session_file_missing() {
        let err = parse_session_file(Path::new("/definitely/not/here_x.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NotFound { .. }));
    }
}
