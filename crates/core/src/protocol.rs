// crates/core/src/protocol.rs
//! Typed wire vocabulary spoken with `pi --mode rpc`.
//!
//! Outbound: [`RpcRequest`] wrapping an [`RpcCommand`]. Inbound: every frame
//! carries a `type`; `"response"` frames become [`RpcResponse`], everything we
//! know becomes an [`RpcEvent`], anything else is passed through untouched as
//! [`InboundFrame::Unrecognized`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ModelInfo;

// ============================================================================
// Outbound
// ============================================================================

/// Base64 image attached to a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptImage {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl PromptImage {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "image".into(),
            source: ImageSource {
                kind: "base64".into(),
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }
}

/// Command vocabulary. Serialized with the command name as `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcCommand {
    Prompt {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<PromptImage>,
    },
    Steer {
        message: String,
    },
    FollowUp {
        message: String,
    },
    Abort,
    GetState,
    GetAvailableModels,
    #[serde(rename_all = "camelCase")]
    SetModel {
        provider: String,
        model_id: String,
    },
    CycleModel,
    CycleThinkingLevel,
    SetThinkingLevel {
        level: String,
    },
    #[serde(rename_all = "camelCase")]
    Compact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_instructions: Option<String>,
    },
    NewSession,
    #[serde(rename_all = "camelCase")]
    SwitchSession {
        session_path: String,
    },
    GetMessages,
    GetSessionStats,
}

impl RpcCommand {
    pub fn prompt(message: impl Into<String>) -> Self {
        Self::Prompt {
            message: message.into(),
            images: Vec::new(),
        }
    }

    /// Wire name, echoed back as `command` in the matching response.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Steer { .. } => "steer",
            Self::FollowUp { .. } => "follow_up",
            Self::Abort => "abort",
            Self::GetState => "get_state",
            Self::GetAvailableModels => "get_available_models",
            Self::SetModel { .. } => "set_model",
            Self::CycleModel => "cycle_model",
            Self::CycleThinkingLevel => "cycle_thinking_level",
            Self::SetThinkingLevel { .. } => "set_thinking_level",
            Self::Compact { .. } => "compact",
            Self::NewSession => "new_session",
            Self::SwitchSession { .. } => "switch_session",
            Self::GetMessages => "get_messages",
            Self::GetSessionStats => "get_session_stats",
        }
    }
}

/// A command plus the optional correlation id the agent echoes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub command: RpcCommand,
}

// ============================================================================
// Inbound
// ============================================================================

/// `{"type":"response", ...}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// `Ok(data)` on success, `Err(message)` otherwise.
    pub fn into_result(self) -> Result<Option<Value>, String> {
        if self.success {
            Ok(self.data)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| format!("{} failed", self.command)))
        }
    }
}

/// Content of an agent message: either a bare string or typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "toolCall")]
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    #[serde(other)]
    Other,
}

impl MessageContent {
    /// Visible text: the string itself, or all `text` blocks joined by newlines.
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn thinking(&self) -> Option<String> {
        let Self::Blocks(blocks) = self else {
            return None;
        };
        let parts: Vec<&str> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                    Some(thinking.as_str())
                }
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        let blocks: &[ContentBlock] = match self {
            Self::Blocks(blocks) => blocks,
            Self::Text(_) => &[],
        };
        blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }
}

/// A message as the agent reports it (`user`, `assistant`, `toolResult`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Streaming sub-events carried by `message_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    Start,
    TextStart,
    TextDelta {
        delta: String,
    },
    TextEnd {
        #[serde(default)]
        content: String,
    },
    ThinkingStart,
    ThinkingDelta {
        delta: String,
    },
    ThinkingEnd {
        #[serde(default)]
        content: String,
    },
    ToolcallStart,
    ToolcallDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolcallEnd {
        #[serde(default)]
        tool_call: Value,
    },
    Done,
    Error {
        /// Partial assistant message; carries `errorMessage` when known.
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Other,
}

impl AssistantMessageEvent {
    /// Human-readable message for an `error` sub-event.
    pub fn error_message(&self) -> Option<String> {
        let Self::Error { error } = self else {
            return None;
        };
        let message = error
            .get("errorMessage")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("assistant stream failed");
        Some(message.to_string())
    }
}

/// Unsolicited push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcEvent {
    AgentStart,
    AgentEnd {
        #[serde(default)]
        messages: Vec<AgentMessage>,
    },
    MessageStart {
        message: AgentMessage,
    },
    #[serde(rename_all = "camelCase")]
    MessageUpdate {
        #[serde(default)]
        message: Option<AgentMessage>,
        assistant_message_event: AssistantMessageEvent,
    },
    MessageEnd {
        message: AgentMessage,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecutionUpdate {
        tool_call_id: String,
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        partial_result: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecutionEnd {
        tool_call_id: String,
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename_all = "camelCase")]
    ExtensionError {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
}

impl RpcEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionUpdate { .. } => "tool_execution_update",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::ExtensionError { .. } => "extension_error",
        }
    }
}

/// Classification of one decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(RpcResponse),
    Event(RpcEvent),
    /// Unknown `type`, or a known one whose shape did not match.
    Unrecognized { kind: String, raw: Value },
}

impl InboundFrame {
    pub fn classify(raw: Value) -> Self {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let decoded = if kind == "response" {
            RpcResponse::deserialize(&raw).map(InboundFrame::Response)
        } else {
            RpcEvent::deserialize(&raw).map(InboundFrame::Event)
        };

        match decoded {
            Ok(frame) => frame,
            Err(e) => {
                if is_known_kind(&kind) {
                    tracing::warn!(kind = %kind, error = %e, "frame did not match its schema");
                }
                InboundFrame::Unrecognized { kind, raw }
            }
        }
    }
}

fn is_known_kind(kind: &str) -> bool {
    matches!(
        kind,
        "response"
            | "agent_start"
            | "agent_end"
            | "message_start"
            | "message_update"
            | "message_end"
            | "tool_execution_start"
            | "tool_execution_update"
            | "tool_execution_end"
            | "extension_error"
    )
}

/// `get_state` response payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcState {
    pub model: Option<ModelInfo>,
    pub thinking_level: Option<String>,
    pub is_streaming: bool,
    pub is_compacting: bool,
    pub session_file: Option<String>,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
}

// ============================================================================
// Events delivered to a Managed Session
// ============================================================================

/// Everything a live session reacts to, from one sum type.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Push event from the agent, in stream order.
    Rpc(RpcEvent),
    /// A response nobody was waiting for (fire-and-forget commands).
    Response(RpcResponse),
    StateLoaded(RpcState),
    ModelsLoaded(Vec<ModelInfo>),
    ModelChanged(ModelInfo),
    ThinkingLevelChanged(String),
    MessagesLoaded(Vec<AgentMessage>),
    SessionSwitched { path: PathBuf },
    /// A correlated command failed; stored as the session's last error.
    CommandFailed { command: String, message: String },
    Ready,
    StartFailed(String),
    Exited { code: Option<i32> },
    Unrecognized { kind: String, raw: Value },
}
