// crates/island/src/live/state.rs
//! Types shared by the session store, the manager actor and its subscribers.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use pi_island_core::{Role, Session, SessionPhase};
use serde::Serialize;
use thiserror::Error;

use crate::rpc::RpcError;

/// Characters kept in [`SessionSummary::preview`].
const PREVIEW_CHARS: usize = 120;

/// Flat, serializable view of a session for list UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub working_directory: PathBuf,
    pub is_live: bool,
    pub phase: SessionPhase,
    pub message_count: usize,
    /// Start of the last user or assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    pub is_streaming: bool,
    pub likely_thinking: bool,
    pub likely_externally_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionSummary {
    pub fn from_session(session: &Session, now: DateTime<Utc>, window: Duration) -> Self {
        let preview = session
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User | Role::Assistant) && !m.text.is_empty())
            .map(|m| truncate_chars(&m.text, PREVIEW_CHARS));

        Self {
            id: session.id.clone(),
            working_directory: session.working_directory.clone(),
            is_live: session.is_live(),
            phase: session.phase.clone(),
            message_count: session.messages.len(),
            preview,
            session_file: session.session_file.clone(),
            last_activity: session.last_activity,
            model: session.model.as_ref().map(|m| m.display_id()),
            thinking_level: session.thinking_level.clone(),
            is_streaming: session.is_streaming,
            likely_thinking: session.likely_thinking(now, window),
            likely_externally_active: session.likely_externally_active(now, window),
            last_error: session.last_error.clone(),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    match first_line.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &first_line[..cut]),
        None => first_line.to_string(),
    }
}

/// Broadcast to every subscriber of the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session entered the collection (created, resumed or discovered on disk).
    SessionAdded { session: SessionSummary },
    /// Something observable about a session changed.
    SessionUpdated { session: SessionSummary },
    SessionRemoved {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Another process appended to a historical session's log.
    ExternallyUpdated {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "newMessages")]
        new_messages: usize,
    },
    SelectionChanged {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("No session with id {0}")]
    SessionNotFound(String),

    #[error("Session {0} has no log file to resume from")]
    NoBackingFile(String),

    #[error("Session {0} is not connected to an agent")]
    NotConnected(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Session manager has stopped")]
    ManagerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_island_core::{ChatMessage, ModelInfo};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_summary_preview_uses_last_text_message() {
        let mut session = Session::historical("abc", "/proj", "/s/p/1_abc.jsonl");
        session.set_messages(vec![
            ChatMessage::user("first question"),
            ChatMessage::assistant("multi\nline answer"),
            ChatMessage::tool_call("c1", "bash", json!({})),
        ]);
        session.model = Some(ModelInfo::new("anthropic", "claude-sonnet-4"));

        let summary = SessionSummary::from_session(&session, Utc::now(), Duration::seconds(10));
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.preview.as_deref(), Some("multi"));
        assert_eq!(summary.model.as_deref(), Some("anthropic/claude-sonnet-4"));
        assert!(!summary.is_live);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(200);
        let cut = truncate_chars(&text, 5);
        assert_eq!(cut, format!("{}…", "é".repeat(5)));
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::ExternallyUpdated {
            session_id: "abc".into(),
            new_messages: 2,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "externally_updated", "sessionId": "abc", "newMessages": 2})
        );

        let event = SessionEvent::SelectionChanged { session_id: None };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "selection_changed", "sessionId": null})
        );
    }

    #[test]
    fn test_manager_error_wraps_rpc() {
        let err: ManagerError = RpcError::NotRunning.into();
        assert_eq!(err.to_string(), "Agent process is not running");
    }
}
