// crates/core/src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Lifecycle of a single tool call, keyed by its tool-call id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Success,
    Error,
}

/// Tool call attached to a `Role::Tool` chat entry.
///
/// Created when the tool starts and mutated in place as updates arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallInfo {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    pub status: ToolStatus,
    /// Preview of streamed output while the tool is still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// A role-tagged chat entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolCallInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            thinking: None,
            tool: None,
            timestamp: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            thinking: None,
            tool: None,
            timestamp: None,
        }
    }

    pub fn tool_call(call_id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let name = name.into();
        Self {
            role: Role::Tool,
            text: name.clone(),
            thinking: None,
            tool: Some(ToolCallInfo {
                call_id: call_id.into(),
                name,
                args,
                status: ToolStatus::Running,
                partial_output: None,
                result: None,
            }),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    /// Tool-call id of this entry, if it is a tool placeholder.
    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool.as_ref().map(|t| t.call_id.as_str())
    }
}

/// A provider model as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
}

impl ModelInfo {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            name: None,
            reasoning: false,
            context_window: None,
        }
    }

    /// `provider/id`, the form shown next to a session.
    pub fn display_id(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}

/// Connection phase of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "message", rename_all = "snake_case")]
pub enum SessionPhase {
    Disconnected,
    Starting,
    Idle,
    Thinking,
    Executing,
    Error(String),
}

impl SessionPhase {
    /// True while the agent is mid-turn.
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionPhase::Thinking | SessionPhase::Executing)
    }

    pub fn label(&self) -> &str {
        match self {
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Starting => "starting",
            SessionPhase::Idle => "idle",
            SessionPhase::Thinking => "thinking",
            SessionPhase::Executing => "executing",
            SessionPhase::Error(message) => message,
        }
    }
}
