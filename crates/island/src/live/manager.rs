// crates/island/src/live/manager.rs
//! Central orchestrator for live and historical sessions.
//!
//! A single actor task owns the [`SessionStore`] and every agent connection.
//! Everything else (callers, RPC event pumps, the file watcher, parse tasks)
//! talks to it through [`ManagerCommand`] messages, so the session map has
//! exactly one writer. Observable changes go out on a broadcast channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pi_island_core::{
    load_recent_sessions, parse_session_file, AgentMessage, ClientEvent, ModelInfo, PromptImage,
    RpcCommand, RpcState, Session, SessionPhase,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::state::{ManagerError, SessionEvent, SessionSummary};
use super::store::{FileAction, ResumePlan, SessionStore};
use super::watcher::{start_watcher, FileEvent, WatcherHandle, DEFAULT_LATENCY};
use crate::rpc::{AgentConnection, AgentLauncher, EventSender, LaunchOptions, RpcError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub sessions_dir: PathBuf,
    /// Startup historical load bound per project directory.
    pub startup_files_per_project: usize,
    pub activity_window: chrono::Duration,
    pub watcher_latency: Duration,
    /// Start the file watcher.
    pub watch: bool,
    /// Load recent historical sessions at startup.
    pub load_history: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Launch new sessions with `--no-session`. Resumed sessions always persist.
    pub no_session: bool,
}

impl ManagerConfig {
    /// Launch parameters for one agent. A resumed session is opened through
    /// `switch_session` after launch, so `session_file` stays unset here.
    pub fn launch_options(&self, cwd: PathBuf, resuming: bool) -> LaunchOptions {
        LaunchOptions {
            cwd,
            provider: self.provider.clone(),
            model: self.model.clone(),
            session_file: None,
            no_session: self.no_session && !resuming,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sessions_dir: pi_island_core::default_sessions_dir().unwrap_or_default(),
            startup_files_per_project: 3,
            activity_window: chrono::Duration::seconds(10),
            watcher_latency: DEFAULT_LATENCY,
            watch: true,
            load_history: true,
            provider: None,
            model: None,
            no_session: false,
        }
    }
}

/// Commands addressed to one live session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Prompt {
        message: String,
        images: Vec<PromptImage>,
    },
    Steer(String),
    FollowUp(String),
    Abort,
    SetModel {
        provider: String,
        model_id: String,
    },
    CycleModel,
    CycleThinkingLevel,
    SetThinkingLevel(String),
    Compact(Option<String>),
    RefreshState,
}

type Reply<T> = oneshot::Sender<T>;

enum ManagerCommand {
    Create {
        cwd: PathBuf,
        reply: Reply<String>,
    },
    Resume {
        session_id: String,
        reply: Reply<Result<String, ManagerError>>,
    },
    Session {
        session_id: String,
        command: SessionCommand,
        reply: Reply<Result<(), ManagerError>>,
    },
    Stop {
        session_id: String,
        reply: Reply<Result<(), ManagerError>>,
    },
    Select {
        session_id: String,
        reply: Reply<Result<(), ManagerError>>,
    },
    Selected {
        reply: Reply<Option<String>>,
    },
    List {
        reply: Reply<Vec<SessionSummary>>,
    },
    Get {
        session_id: String,
        reply: Reply<Option<Session>>,
    },
    LoadHistory {
        reply: Option<Reply<usize>>,
    },
    Shutdown {
        reply: Reply<()>,
    },

    // Internal traffic from tasks spawned by the actor.
    Client {
        session_id: String,
        event: ClientEvent,
    },
    Connected {
        session_id: String,
        conn: Arc<dyn AgentConnection>,
    },
    File(FileEvent),
    Parsed {
        session: Option<Session>,
        modified: Option<DateTime<Utc>>,
        reparse_of: Option<String>,
    },
    HistoryLoaded {
        sessions: Vec<Session>,
        reply: Option<Reply<usize>>,
    },
}

/// An outbound fire-and-forget command, written in submission order.
struct Outgoing {
    command: RpcCommand,
    reply: Reply<Result<(), ManagerError>>,
}

/// A connected agent plus its ordered write queue.
struct Link {
    conn: Arc<dyn AgentConnection>,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl Link {
    fn new(session_id: String, conn: Arc<dyn AgentConnection>) -> Self {
        let (outbox, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let writer = conn.clone();
        tokio::spawn(async move {
            while let Some(Outgoing { command, reply }) = rx.recv().await {
                let name = command.name();
                let result = match writer.send(command).await {
                    Err(e) if name == "abort" => {
                        debug!(session_id = %session_id, error = %e, "abort not delivered");
                        Ok(())
                    }
                    other => other.map_err(ManagerError::from),
                };
                let _ = reply.send(result);
            }
        });
        Self { conn, outbox }
    }
}

pub struct SessionManager {
    store: SessionStore,
    links: HashMap<String, Link>,
    launcher: Arc<dyn AgentLauncher>,
    config: ManagerConfig,
    tx: mpsc::UnboundedSender<ManagerCommand>,
    events: broadcast::Sender<SessionEvent>,
    _watcher: Option<WatcherHandle>,
}

impl SessionManager {
    /// Spawn the actor (and, if configured, the watcher and startup load).
    /// Must be called from within a tokio runtime.
    pub fn start(config: ManagerConfig, launcher: Arc<dyn AgentLauncher>) -> SessionManagerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let watcher = if config.watch {
            spawn_watcher(&config, tx.clone())
        } else {
            None
        };
        if config.load_history {
            let _ = tx.send(ManagerCommand::LoadHistory { reply: None });
        }

        let manager = SessionManager {
            store: SessionStore::new(config.activity_window),
            links: HashMap::new(),
            launcher,
            config,
            tx: tx.clone(),
            events: events.clone(),
            _watcher: watcher,
        };
        tokio::spawn(manager.run(rx));

        SessionManagerHandle { tx, events }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerCommand>) {
        info!(sessions_dir = %self.config.sessions_dir.display(), "session manager started");
        while let Some(command) = rx.recv().await {
            match command {
                ManagerCommand::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                command => {
                    self.handle(command);
                    self.flush_events();
                }
            }
        }
        info!("session manager stopped");
    }

    fn flush_events(&mut self) {
        for event in self.store.take_events() {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn handle(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Create { cwd, reply } => {
                let id = self.store.create_live(cwd.clone(), Utc::now());
                self.spawn_connect(id.clone(), cwd, None);
                let _ = reply.send(id);
            }
            ManagerCommand::Resume { session_id, reply } => {
                let result = self.resume(&session_id);
                let _ = reply.send(result);
            }
            ManagerCommand::Session {
                session_id,
                command,
                reply,
            } => self.session_command(session_id, command, reply),
            ManagerCommand::Stop { session_id, reply } => {
                let _ = reply.send(self.stop_session(&session_id));
            }
            ManagerCommand::Select { session_id, reply } => {
                let _ = reply.send(self.store.select(&session_id));
            }
            ManagerCommand::Selected { reply } => {
                let _ = reply.send(self.store.selected().map(str::to_string));
            }
            ManagerCommand::List { reply } => {
                let _ = reply.send(self.store.list());
            }
            ManagerCommand::Get { session_id, reply } => {
                let _ = reply.send(self.store.get(&session_id).cloned());
            }
            ManagerCommand::LoadHistory { reply } => self.spawn_history_load(reply),
            // Handled by `run`.
            ManagerCommand::Shutdown { .. } => {}
            ManagerCommand::Client { session_id, event } => {
                let exited = matches!(event, ClientEvent::Exited { .. });
                self.store
                    .apply_client_event(&session_id, &event, Utc::now());
                if exited && self.links.remove(&session_id).is_some() {
                    info!(session_id = %session_id, "agent process exited");
                }
            }
            ManagerCommand::Connected { session_id, conn } => {
                if self.store.get(&session_id).is_some_and(Session::is_live) {
                    debug!(session_id = %session_id, "agent connected");
                    self.links
                        .insert(session_id.clone(), Link::new(session_id, conn));
                } else {
                    debug!(session_id = %session_id, "session gone before connect; stopping agent");
                    tokio::spawn(async move { conn.stop().await });
                }
            }
            ManagerCommand::File(event) => self.file_event(event),
            ManagerCommand::Parsed {
                session,
                modified,
                reparse_of,
            } => {
                let Some(session) = session else {
                    return;
                };
                match reparse_of {
                    Some(id) => {
                        self.store.merge_reparsed(&id, session);
                    }
                    None => {
                        self.store.register_parsed(session, modified);
                    }
                }
            }
            ManagerCommand::HistoryLoaded { sessions, reply } => {
                let total = sessions.len();
                let mut registered = 0;
                for session in sessions {
                    let unclaimed = session
                        .session_file
                        .as_deref()
                        .is_some_and(|f| self.store.should_parse(f));
                    if unclaimed && self.store.register_parsed(session, None) {
                        registered += 1;
                    }
                }
                info!(registered, total, "historical sessions loaded");
                if let Some(reply) = reply {
                    let _ = reply.send(registered);
                }
            }
        }
    }

    fn resume(&mut self, session_id: &str) -> Result<String, ManagerError> {
        match self.store.begin_resume(session_id)? {
            ResumePlan::ReuseLive(id) => Ok(id),
            ResumePlan::Started {
                session_id,
                session_file,
            } => {
                let cwd = self
                    .store
                    .get(&session_id)
                    .map(|s| s.working_directory.clone())
                    .unwrap_or_default();
                self.spawn_connect(session_id.clone(), cwd, Some(session_file));
                Ok(session_id)
            }
        }
    }

    fn session_command(
        &mut self,
        session_id: String,
        command: SessionCommand,
        reply: Reply<Result<(), ManagerError>>,
    ) {
        let Some(link) = self.links.get(&session_id) else {
            let err = if self.store.get(&session_id).is_some() {
                ManagerError::NotConnected(session_id)
            } else {
                ManagerError::SessionNotFound(session_id)
            };
            let _ = reply.send(Err(err));
            return;
        };

        // Until the startup sequence finishes, the agent may still be on
        // another session.
        let starting = self
            .store
            .get(&session_id)
            .is_some_and(|s| s.phase == SessionPhase::Starting);
        if starting && !matches!(command, SessionCommand::Abort) {
            debug!(session_id = %session_id, "command before startup finished");
            let _ = reply.send(Err(ManagerError::NotConnected(session_id)));
            return;
        }

        let outgoing = match command {
            SessionCommand::Prompt { message, images } => {
                if let Err(e) = self.store.begin_prompt(&session_id, &message, Utc::now()) {
                    let _ = reply.send(Err(e));
                    return;
                }
                RpcCommand::Prompt { message, images }
            }
            SessionCommand::Steer(message) => RpcCommand::Steer { message },
            SessionCommand::FollowUp(message) => RpcCommand::FollowUp { message },
            SessionCommand::Abort => RpcCommand::Abort,
            SessionCommand::CycleModel => RpcCommand::CycleModel,
            SessionCommand::CycleThinkingLevel => RpcCommand::CycleThinkingLevel,
            correlated => {
                let conn = link.conn.clone();
                tokio::spawn(run_correlated(
                    conn,
                    session_id,
                    correlated,
                    self.tx.clone(),
                    reply,
                ));
                return;
            }
        };

        if let Err(mpsc::error::SendError(out)) = link.outbox.send(Outgoing {
            command: outgoing,
            reply,
        }) {
            let _ = out.reply.send(Err(RpcError::NotRunning.into()));
        }
    }

    fn stop_session(&mut self, session_id: &str) -> Result<(), ManagerError> {
        if let Some(link) = self.links.remove(session_id) {
            tokio::spawn(async move { link.conn.stop().await });
        }
        if self.store.remove(session_id).is_none() {
            return Err(ManagerError::SessionNotFound(session_id.to_string()));
        }
        info!(session_id = %session_id, "session stopped");
        Ok(())
    }

    fn file_event(&mut self, event: FileEvent) {
        match event {
            FileEvent::Created { path, modified } => self.parse_if_unclaimed(path, modified),
            FileEvent::Modified { path, modified } => {
                match self.store.on_file_modified(&path, modified) {
                    FileAction::Ignore => {}
                    FileAction::Reparse { session_id } => {
                        self.spawn_parse(path, Some(modified), Some(session_id));
                    }
                    FileAction::TreatAsCreated => self.parse_if_unclaimed(path, modified),
                }
            }
            FileEvent::Removed { path } => {
                for id in self.store.on_file_removed(&path) {
                    debug!(session_id = %id, path = %path.display(), "historical session removed with its file");
                }
            }
        }
    }

    fn parse_if_unclaimed(&self, path: PathBuf, modified: DateTime<Utc>) {
        if self.store.should_parse(&path) {
            self.spawn_parse(path, Some(modified), None);
        }
    }

    /// Parse off the actor task and post the result back.
    fn spawn_parse(&self, path: PathBuf, modified: Option<DateTime<Utc>>, reparse_of: Option<String>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let session = match parse_session_file(&path).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "session file not parsed");
                    None
                }
            };
            let _ = tx.send(ManagerCommand::Parsed {
                session,
                modified,
                reparse_of,
            });
        });
    }

    fn spawn_history_load(&self, reply: Option<Reply<usize>>) {
        let tx = self.tx.clone();
        let root = self.config.sessions_dir.clone();
        let per_project = self.config.startup_files_per_project;
        tokio::spawn(async move {
            let sessions = load_recent_sessions(&root, per_project).await;
            let _ = tx.send(ManagerCommand::HistoryLoaded { sessions, reply });
        });
    }

    fn spawn_connect(&self, session_id: String, cwd: PathBuf, resume_file: Option<PathBuf>) {
        let options = self.config.launch_options(cwd, resume_file.is_some());
        tokio::spawn(connect_session(
            self.launcher.clone(),
            options,
            session_id,
            resume_file,
            self.tx.clone(),
        ));
    }

    async fn shutdown(&mut self) {
        info!(sessions = self.links.len(), "stopping live sessions");
        for (_, link) in self.links.drain() {
            link.conn.stop().await;
        }
    }
}

fn spawn_watcher(
    config: &ManagerConfig,
    tx: mpsc::UnboundedSender<ManagerCommand>,
) -> Option<WatcherHandle> {
    let (file_tx, mut file_rx) = mpsc::channel::<FileEvent>(EVENT_CAPACITY);
    let handle = match start_watcher(config.sessions_dir.clone(), config.watcher_latency, file_tx) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start file watcher: {}", e);
            return None;
        }
    };
    tokio::spawn(async move {
        while let Some(event) = file_rx.recv().await {
            if tx.send(ManagerCommand::File(event)).is_err() {
                break;
            }
        }
    });
    Some(handle)
}

/// Launch an agent for `session_id` and run its startup sequence.
///
/// Every outcome reaches the actor as a [`ClientEvent`] through the same
/// ordered channel the agent's push events use.
async fn connect_session(
    launcher: Arc<dyn AgentLauncher>,
    options: LaunchOptions,
    session_id: String,
    resume_file: Option<PathBuf>,
    tx: mpsc::UnboundedSender<ManagerCommand>,
) {
    let (events, mut events_rx) = mpsc::unbounded_channel::<ClientEvent>();

    let pump_tx = tx.clone();
    let pump_id = session_id.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let command = ManagerCommand::Client {
                session_id: pump_id.clone(),
                event,
            };
            if pump_tx.send(command).is_err() {
                break;
            }
        }
    });

    let conn = match launcher.launch(&options, events.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "agent launch failed");
            let _ = events.send(ClientEvent::StartFailed(e.to_string()));
            return;
        }
    };

    let _ = tx.send(ManagerCommand::Connected {
        session_id: session_id.clone(),
        conn: conn.clone(),
    });

    if let Err(e) = startup_sequence(conn.as_ref(), resume_file.as_deref(), &events).await {
        warn!(session_id = %session_id, error = %e, "session startup failed");
        let _ = events.send(ClientEvent::StartFailed(e.to_string()));
    }
}

async fn startup_sequence(
    conn: &dyn AgentConnection,
    resume_file: Option<&Path>,
    events: &EventSender,
) -> Result<(), RpcError> {
    match resume_file {
        Some(path) => {
            conn.request(RpcCommand::SwitchSession {
                session_path: path.to_string_lossy().into_owned(),
            })
            .await?;
            let _ = events.send(ClientEvent::SessionSwitched {
                path: path.to_path_buf(),
            });
            let data = conn.request(RpcCommand::GetMessages).await?;
            let messages: Vec<AgentMessage> = decode_list(data.as_ref(), "messages");
            let _ = events.send(ClientEvent::MessagesLoaded(messages));
        }
        None => {
            conn.request(RpcCommand::NewSession).await?;
        }
    }

    let state = conn.request(RpcCommand::GetState).await?;
    let state: RpcState = state
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let _ = events.send(ClientEvent::StateLoaded(state));

    let models = conn.request(RpcCommand::GetAvailableModels).await?;
    let models: Vec<ModelInfo> = decode_list(models.as_ref(), "models");
    let _ = events.send(ClientEvent::ModelsLoaded(models));

    let _ = events.send(ClientEvent::Ready);
    Ok(())
}

/// Decode `data[key]` (or `data` itself when it is an array), skipping
/// elements that do not match.
fn decode_list<T: DeserializeOwned>(data: Option<&Value>, key: &str) -> Vec<T> {
    let items = match data {
        Some(Value::Array(items)) => items,
        Some(obj) => match obj.get(key) {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        None => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

/// Correlated session commands. Success and failure both flow back into the
/// session as client events.
async fn run_correlated(
    conn: Arc<dyn AgentConnection>,
    session_id: String,
    command: SessionCommand,
    tx: mpsc::UnboundedSender<ManagerCommand>,
    reply: Reply<Result<(), ManagerError>>,
) {
    let post = |event: ClientEvent| {
        let _ = tx.send(ManagerCommand::Client {
            session_id: session_id.clone(),
            event,
        });
    };

    let result = match command {
        SessionCommand::SetModel { provider, model_id } => conn
            .request(RpcCommand::SetModel {
                provider: provider.clone(),
                model_id: model_id.clone(),
            })
            .await
            .map(|data| {
                let model = data
                    .and_then(|v| serde_json::from_value::<ModelInfo>(v).ok())
                    .unwrap_or_else(|| ModelInfo::new(provider, model_id));
                post(ClientEvent::ModelChanged(model));
            }),
        SessionCommand::SetThinkingLevel(level) => conn
            .request(RpcCommand::SetThinkingLevel {
                level: level.clone(),
            })
            .await
            .map(|_| post(ClientEvent::ThinkingLevelChanged(level))),
        SessionCommand::Compact(custom_instructions) => {
            match conn
                .request(RpcCommand::Compact {
                    custom_instructions,
                })
                .await
            {
                Ok(_) => conn.request(RpcCommand::GetMessages).await.map(|data| {
                    post(ClientEvent::MessagesLoaded(decode_list(
                        data.as_ref(),
                        "messages",
                    )))
                }),
                Err(e) => Err(e),
            }
        }
        SessionCommand::RefreshState => conn.request(RpcCommand::GetState).await.map(|data| {
            let state = data
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            post(ClientEvent::StateLoaded(state));
        }),
        other => {
            debug!(?other, "not a correlated command");
            Ok(())
        }
    };

    if let Err(e) = &result {
        let command = match e {
            RpcError::CommandFailed { command, .. } | RpcError::Timeout { command, .. } => {
                command.clone()
            }
            _ => "command".to_string(),
        };
        post(ClientEvent::CommandFailed {
            command,
            message: e.to_string(),
        });
    }
    let _ = reply.send(result.map_err(ManagerError::from));
}

/// Cloneable entry point to a running [`SessionManager`].
#[derive(Clone)]
pub struct SessionManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManagerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> ManagerCommand,
    ) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| ManagerError::ManagerStopped)?;
        rx.await.map_err(|_| ManagerError::ManagerStopped)
    }

    async fn session(
        &self,
        session_id: &str,
        command: SessionCommand,
    ) -> Result<(), ManagerError> {
        let session_id = session_id.to_string();
        self.call(|reply| ManagerCommand::Session {
            session_id,
            command,
            reply,
        })
        .await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a new live session in `cwd`. Returns as soon as the entity is
    /// registered; connection progress arrives as events.
    pub async fn create(&self, cwd: impl Into<PathBuf>) -> Result<String, ManagerError> {
        let cwd = cwd.into();
        self.call(|reply| ManagerCommand::Create { cwd, reply }).await
    }

    /// Resume a historical session. Returns the id of the live session now
    /// standing in for it.
    pub async fn resume(&self, session_id: &str) -> Result<String, ManagerError> {
        let session_id = session_id.to_string();
        self.call(|reply| ManagerCommand::Resume { session_id, reply })
            .await?
    }

    pub async fn prompt(&self, session_id: &str, message: impl Into<String>) -> Result<(), ManagerError> {
        self.prompt_with_images(session_id, message, Vec::new()).await
    }

    pub async fn prompt_with_images(
        &self,
        session_id: &str,
        message: impl Into<String>,
        images: Vec<PromptImage>,
    ) -> Result<(), ManagerError> {
        let command = SessionCommand::Prompt {
            message: message.into(),
            images,
        };
        self.session(session_id, command).await
    }

    pub async fn steer(&self, session_id: &str, message: impl Into<String>) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::Steer(message.into()))
            .await
    }

    pub async fn follow_up(
        &self,
        session_id: &str,
        message: impl Into<String>,
    ) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::FollowUp(message.into()))
            .await
    }

    /// Best-effort; delivery failures are not reported.
    pub async fn abort(&self, session_id: &str) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::Abort).await
    }

    pub async fn set_model(
        &self,
        session_id: &str,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let command = SessionCommand::SetModel {
            provider: provider.into(),
            model_id: model_id.into(),
        };
        self.session(session_id, command).await
    }

    pub async fn cycle_model(&self, session_id: &str) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::CycleModel).await
    }

    pub async fn cycle_thinking_level(&self, session_id: &str) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::CycleThinkingLevel)
            .await
    }

    pub async fn set_thinking_level(
        &self,
        session_id: &str,
        level: impl Into<String>,
    ) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::SetThinkingLevel(level.into()))
            .await
    }

    pub async fn compact(
        &self,
        session_id: &str,
        custom_instructions: Option<String>,
    ) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::Compact(custom_instructions))
            .await
    }

    pub async fn refresh_state(&self, session_id: &str) -> Result<(), ManagerError> {
        self.session(session_id, SessionCommand::RefreshState).await
    }

    /// Stop the agent (if any) and drop the session from the map.
    pub async fn stop(&self, session_id: &str) -> Result<(), ManagerError> {
        let session_id = session_id.to_string();
        self.call(|reply| ManagerCommand::Stop { session_id, reply })
            .await?
    }

    pub async fn select(&self, session_id: &str) -> Result<(), ManagerError> {
        let session_id = session_id.to_string();
        self.call(|reply| ManagerCommand::Select { session_id, reply })
            .await?
    }

    pub async fn selected(&self) -> Result<Option<String>, ManagerError> {
        self.call(|reply| ManagerCommand::Selected { reply }).await
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>, ManagerError> {
        self.call(|reply| ManagerCommand::List { reply }).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, ManagerError> {
        let session_id = session_id.to_string();
        self.call(|reply| ManagerCommand::Get { session_id, reply })
            .await
    }

    /// Run the startup historical load now. Returns how many sessions were
    /// registered.
    pub async fn load_history(&self) -> Result<usize, ManagerError> {
        self.call(|reply| ManagerCommand::LoadHistory { reply: Some(reply) })
            .await
    }

    /// Inject a file event as if the watcher had produced it.
    pub fn notify_file(&self, event: FileEvent) -> Result<(), ManagerError> {
        self.tx
            .send(ManagerCommand::File(event))
            .map_err(|_| ManagerError::ManagerStopped)
    }

    /// Stop every agent and end the actor.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.call(|reply| ManagerCommand::Shutdown { reply }).await
    }
}
