// crates/core/src/session.rs
//! The unified session entity and the live-session state machine.
//!
//! A session is either live (backed by an agent process and driven by
//! [`ClientEvent`]s) or historical (built once from a log file and never
//! transitioned). `is_live` only ever goes from true to false.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::parser::parse_timestamp;
use crate::protocol::{AgentMessage, AssistantMessageEvent, ClientEvent, RpcEvent, RpcResponse};
use crate::types::{ChatMessage, ModelInfo, Role, SessionPhase, ToolCallInfo, ToolStatus};

/// Lines kept in a running tool's output preview.
const PARTIAL_PREVIEW_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub working_directory: PathBuf,
    is_live: bool,
    pub phase: SessionPhase,
    pub messages: Vec<ChatMessage>,
    pub session_file: Option<PathBuf>,
    /// Last mtime reported by the file notifier. Never filled by a stat from
    /// a caller of this type.
    pub file_modified_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub model: Option<ModelInfo>,
    pub available_models: Vec<ModelInfo>,
    pub thinking_level: Option<String>,
    pub streaming_text: String,
    pub streaming_thinking: String,
    pub is_streaming: bool,
    pub last_error: Option<String>,
    #[serde(skip)]
    tool_index: HashMap<String, usize>,
    #[serde(skip)]
    stream_finalized: bool,
}

impl Session {
    fn new(id: String, working_directory: PathBuf, is_live: bool, phase: SessionPhase) -> Self {
        Self {
            id,
            working_directory,
            is_live,
            phase,
            messages: Vec::new(),
            session_file: None,
            file_modified_at: None,
            last_activity: DateTime::<Utc>::UNIX_EPOCH,
            model: None,
            available_models: Vec::new(),
            thinking_level: None,
            streaming_text: String::new(),
            streaming_thinking: String::new(),
            is_streaming: false,
            last_error: None,
            tool_index: HashMap::new(),
            stream_finalized: false,
        }
    }

    /// A live session about to be connected.
    pub fn live(id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self::new(
            id.into(),
            working_directory.into(),
            true,
            SessionPhase::Starting,
        )
    }

    /// A historical session read from `session_file`.
    pub fn historical(
        id: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        session_file: impl Into<PathBuf>,
    ) -> Self {
        let mut session = Self::new(
            id.into(),
            working_directory.into(),
            false,
            SessionPhase::Disconnected,
        );
        session.session_file = Some(session_file.into());
        session
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// Whether the agent is mid-turn (streaming, thinking or executing).
    pub fn is_active_turn(&self) -> bool {
        self.is_live && (self.is_streaming || self.phase.is_busy())
    }

    pub fn backs(&self, path: &Path) -> bool {
        self.session_file.as_deref() == Some(path)
    }

    /// Replace the message list wholesale.
    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
        self.rebuild_tool_index();
    }

    fn rebuild_tool_index(&mut self) {
        self.tool_index = self
            .messages
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.tool_call_id().map(|id| (id.to_string(), i)))
            .collect();
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Historical: last message is from the user and the file was written recently.
    pub fn likely_thinking(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.likely_externally_active(now, window)
            && self.messages.last().is_some_and(|m| m.role == Role::User)
    }

    /// Historical: the file was written recently.
    pub fn likely_externally_active(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.is_live
            && self
                .file_modified_at
                .is_some_and(|mtime| now.signed_duration_since(mtime) <= window)
    }

    /// Optimistically record a prompt the user just sent.
    ///
    /// Only an `Idle` or `Error` session starts a turn; returns false otherwise.
    pub fn begin_prompt(&mut self, text: &str, now: DateTime<Utc>) -> bool {
        if !self.is_live || !matches!(self.phase, SessionPhase::Idle | SessionPhase::Error(_)) {
            return false;
        }
        self.messages.push(ChatMessage::user(text).with_timestamp(now));
        self.phase = SessionPhase::Thinking;
        self.last_error = None;
        self.touch(now);
        true
    }

    /// Apply one event. Returns true when anything observable changed.
    pub fn apply(&mut self, event: &ClientEvent, now: DateTime<Utc>) -> bool {
        if !self.is_live {
            return false;
        }
        match event {
            ClientEvent::Rpc(rpc) => self.apply_rpc(rpc, now),
            ClientEvent::Response(resp) => self.apply_response(resp),
            ClientEvent::CommandFailed { command, message } => {
                self.command_failed(command, message.clone())
            }
            ClientEvent::StateLoaded(state) => {
                if state.model.is_some() {
                    self.model.clone_from(&state.model);
                }
                if state.thinking_level.is_some() {
                    self.thinking_level.clone_from(&state.thinking_level);
                }
                if let Some(file) = &state.session_file {
                    self.session_file = Some(PathBuf::from(file));
                }
                if state.is_streaming && self.phase == SessionPhase::Idle {
                    self.phase = SessionPhase::Thinking;
                    self.is_streaming = true;
                }
                true
            }
            ClientEvent::ModelsLoaded(models) => {
                self.available_models.clone_from(models);
                true
            }
            ClientEvent::ModelChanged(model) => {
                self.model = Some(model.clone());
                true
            }
            ClientEvent::ThinkingLevelChanged(level) => {
                self.thinking_level = Some(level.clone());
                true
            }
            ClientEvent::MessagesLoaded(messages) => {
                let chat = chat_messages_from_agent(messages);
                if let Some(ts) = chat.iter().filter_map(|m| m.timestamp).max() {
                    self.touch(ts);
                }
                self.set_messages(chat);
                true
            }
            ClientEvent::SessionSwitched { path } => {
                self.session_file = Some(path.clone());
                true
            }
            ClientEvent::Ready => {
                if self.phase == SessionPhase::Starting {
                    self.phase = SessionPhase::Idle;
                }
                self.touch(now);
                true
            }
            ClientEvent::StartFailed(message) => {
                self.phase = SessionPhase::Error(message.clone());
                self.last_error = Some(message.clone());
                true
            }
            ClientEvent::Exited { .. } => {
                self.finalize_streaming(now);
                self.is_live = false;
                self.is_streaming = false;
                self.phase = SessionPhase::Disconnected;
                true
            }
            ClientEvent::Unrecognized { .. } => false,
        }
    }

    fn apply_rpc(&mut self, event: &RpcEvent, now: DateTime<Utc>) -> bool {
        self.touch(now);
        match event {
            RpcEvent::AgentStart => {
                self.phase = SessionPhase::Thinking;
                self.is_streaming = true;
                self.streaming_text.clear();
                self.streaming_thinking.clear();
                self.last_error = None;
            }
            RpcEvent::AgentEnd { .. } => {
                self.finalize_streaming(now);
                self.is_streaming = false;
                self.phase = SessionPhase::Idle;
            }
            RpcEvent::MessageStart { message } => {
                // User messages were already appended when the prompt was sent.
                if message.role != "assistant" {
                    return false;
                }
                self.is_streaming = true;
                self.stream_finalized = false;
                self.streaming_text.clear();
                self.streaming_thinking.clear();
            }
            RpcEvent::MessageUpdate {
                assistant_message_event,
                ..
            } => return self.apply_delta(assistant_message_event, now),
            RpcEvent::MessageEnd { message } => {
                if message.role != "assistant" || self.stream_finalized {
                    return false;
                }
                if self.streaming_text.is_empty() && self.streaming_thinking.is_empty() {
                    self.streaming_text = message.content.text();
                    self.streaming_thinking = message.content.thinking().unwrap_or_default();
                }
                if let Some(err) = &message.error_message {
                    self.last_error = Some(err.clone());
                }
                self.finalize_streaming(now);
            }
            RpcEvent::ToolExecutionStart {
                tool_call_id,
                tool_name,
                args,
            } => {
                if !self.streaming_text.is_empty() || !self.streaming_thinking.is_empty() {
                    self.finalize_streaming(now);
                }
                self.phase = SessionPhase::Executing;
                match self.tool_index.get(tool_call_id).copied() {
                    Some(i) => {
                        if let Some(tool) = self.messages[i].tool.as_mut() {
                            tool.args = args.clone();
                            tool.status = ToolStatus::Running;
                        }
                    }
                    None => {
                        let msg = ChatMessage::tool_call(tool_call_id, tool_name, args.clone())
                            .with_timestamp(now);
                        self.tool_index
                            .insert(tool_call_id.clone(), self.messages.len());
                        self.messages.push(msg);
                    }
                }
            }
            RpcEvent::ToolExecutionUpdate {
                tool_call_id,
                partial_result,
                ..
            } => {
                let Some(tool) = self.tool_mut(tool_call_id) else {
                    return false;
                };
                tool.partial_output = Some(tail_lines(&result_text(partial_result)));
            }
            RpcEvent::ToolExecutionEnd {
                tool_call_id,
                tool_name,
                result,
                is_error,
            } => {
                let status = if *is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Success
                };
                let text = result_text(result);
                match self.tool_mut(tool_call_id) {
                    Some(tool) => {
                        tool.status = status;
                        tool.partial_output = None;
                        tool.result = Some(text);
                    }
                    None => {
                        let mut msg = ChatMessage::tool_call(tool_call_id, tool_name, Value::Null)
                            .with_timestamp(now);
                        if let Some(tool) = msg.tool.as_mut() {
                            tool.status = status;
                            tool.result = Some(text);
                        }
                        self.tool_index
                            .insert(tool_call_id.clone(), self.messages.len());
                        self.messages.push(msg);
                    }
                }
                if self.phase == SessionPhase::Executing {
                    self.phase = SessionPhase::Thinking;
                }
            }
            RpcEvent::ExtensionError {
                error,
                error_message,
            } => {
                let message = error
                    .clone()
                    .or_else(|| error_message.clone())
                    .unwrap_or_else(|| "extension error".to_string());
                self.last_error = Some(message);
            }
        }
        true
    }

    fn apply_delta(&mut self, event: &AssistantMessageEvent, now: DateTime<Utc>) -> bool {
        match event {
            AssistantMessageEvent::TextDelta { delta } => {
                self.is_streaming = true;
                self.streaming_text.push_str(delta);
            }
            AssistantMessageEvent::TextEnd { content } => {
                if self.streaming_text.is_empty() {
                    self.streaming_text.clone_from(content);
                }
            }
            AssistantMessageEvent::ThinkingDelta { delta } => {
                self.is_streaming = true;
                self.streaming_thinking.push_str(delta);
            }
            AssistantMessageEvent::ThinkingEnd { content } => {
                if self.streaming_thinking.is_empty() {
                    self.streaming_thinking.clone_from(content);
                }
            }
            AssistantMessageEvent::ToolcallStart => {
                self.phase = SessionPhase::Executing;
            }
            AssistantMessageEvent::Done => {
                self.finalize_streaming(now);
            }
            AssistantMessageEvent::Error { .. } => {
                self.last_error = event.error_message();
                self.finalize_streaming(now);
            }
            AssistantMessageEvent::Start
            | AssistantMessageEvent::TextStart
            | AssistantMessageEvent::ThinkingStart
            | AssistantMessageEvent::ToolcallDelta { .. }
            | AssistantMessageEvent::ToolcallEnd { .. }
            | AssistantMessageEvent::Other => return false,
        }
        true
    }

    /// Move the streaming buffers into the message list.
    fn finalize_streaming(&mut self, now: DateTime<Utc>) {
        self.stream_finalized = true;
        if self.streaming_text.is_empty() && self.streaming_thinking.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.streaming_text);
        let thinking = std::mem::take(&mut self.streaming_thinking);
        let mut msg = ChatMessage::assistant(text).with_timestamp(now);
        if !thinking.is_empty() {
            msg = msg.with_thinking(thinking);
        }
        self.messages.push(msg);
    }

    fn apply_response(&mut self, resp: &RpcResponse) -> bool {
        if !resp.success {
            let message = resp
                .error
                .clone()
                .unwrap_or_else(|| format!("{} failed", resp.command));
            return self.command_failed(&resp.command, message);
        }
        let Some(data) = &resp.data else {
            return false;
        };
        match resp.command.as_str() {
            "cycle_thinking_level" | "set_thinking_level" => {
                match data.get("level").and_then(Value::as_str) {
                    Some(level) => {
                        self.thinking_level = Some(level.to_string());
                        true
                    }
                    None => false,
                }
            }
            "cycle_model" | "set_model" => {
                let model = data.get("model").unwrap_or(data);
                let Ok(model) = serde_json::from_value::<ModelInfo>(model.clone()) else {
                    return false;
                };
                self.model = Some(model);
                if let Some(level) = data.get("thinkingLevel").and_then(Value::as_str) {
                    self.thinking_level = Some(level.to_string());
                }
                true
            }
            _ => false,
        }
    }

    fn command_failed(&mut self, command: &str, message: String) -> bool {
        // Abort is fire-and-forget from the user's point of view.
        if command == "abort" {
            tracing::debug!(session_id = %self.id, error = %message, "abort failed");
            return false;
        }
        tracing::warn!(session_id = %self.id, command, error = %message, "agent command failed");
        if command == "prompt" {
            self.phase = SessionPhase::Error(message.clone());
            self.is_streaming = false;
        }
        self.last_error = Some(message);
        true
    }

    fn tool_mut(&mut self, call_id: &str) -> Option<&mut ToolCallInfo> {
        let &i = self.tool_index.get(call_id)?;
        self.messages.get_mut(i)?.tool.as_mut()
    }
}

/// Convert agent-reported messages into chat entries.
///
/// Tool calls become placeholders that the matching `toolResult` completes
/// in place.
pub fn chat_messages_from_agent(messages: &[AgentMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::new();
    let mut tools: HashMap<String, usize> = HashMap::new();

    for message in messages {
        let timestamp = message.timestamp.as_ref().and_then(parse_timestamp);
        match message.role.as_str() {
            "user" => {
                let text = message.content.text();
                if text.is_empty() {
                    continue;
                }
                let mut msg = ChatMessage::user(text);
                msg.timestamp = timestamp;
                out.push(msg);
            }
            "assistant" => {
                let text = message.content.text();
                let thinking = message.content.thinking();
                if !text.is_empty() || thinking.is_some() {
                    let mut msg = ChatMessage::assistant(text);
                    msg.thinking = thinking;
                    msg.timestamp = timestamp;
                    out.push(msg);
                }
                for (id, name, args) in message.content.tool_calls() {
                    let mut msg = ChatMessage::tool_call(id, name, args.clone());
                    msg.timestamp = timestamp;
                    tools.insert(id.to_string(), out.len());
                    out.push(msg);
                }
            }
            "toolResult" => {
                let Some(call_id) = message.tool_call_id.as_deref() else {
                    continue;
                };
                let status = if message.is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Success
                };
                let result = message.content.text();
                let slot = tools
                    .get(call_id)
                    .and_then(|&i| out.get_mut(i))
                    .and_then(|m| m.tool.as_mut());
                match slot {
                    Some(tool) => {
                        tool.status = status;
                        tool.result = Some(result);
                    }
                    None => {
                        let name = message.tool_name.clone().unwrap_or_default();
                        let mut msg = ChatMessage::tool_call(call_id, name, Value::Null);
                        if let Some(tool) = msg.tool.as_mut() {
                            tool.status = status;
                            tool.result = Some(result);
                        }
                        msg.timestamp = timestamp;
                        out.push(msg);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Text of a tool result: `content` text blocks, a bare string, or raw JSON.
fn result_text(value: &Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
        return blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
    }
    if value.is_null() {
        return String::new();
    }
    value.to_string()
}

fn tail_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(PARTIAL_PREVIEW_LINES);
    lines[start..].join("\n")
}
