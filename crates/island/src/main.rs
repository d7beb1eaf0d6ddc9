// crates/island/src/main.rs
//! pi-island binary.
//!
//! Logs go to stderr; stdout carries JSON only, one document per line, so the
//! output can be piped into another program.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pi_island::auth::{
    Credential, CredentialRefresher, CredentialStore, HttpTokenRefresher, StaticClientConfigSource,
};
use pi_island::live::{ManagerConfig, SessionEvent, SessionManagerHandle, SessionSummary};
use pi_island::{AppConfig, ProcessLauncher, SessionManager};
use pi_island_core::{load_recent_sessions, SessionPhase};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pi-island", version, about = "Session monitor and client for pi agents")]
struct Cli {
    /// Config file (default: ~/.config/pi-island/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent executable
    #[arg(long, global = true)]
    agent: Option<String>,

    /// Sessions root
    #[arg(long, global = true)]
    sessions_dir: Option<PathBuf>,

    /// Correlated request timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List recent historical sessions as JSON
    Sessions {
        /// Log files read per project directory
        #[arg(long)]
        per_project: Option<usize>,
    },
    /// Watch sessions and print every change as a JSON line
    Watch,
    /// Start or resume a session, send one prompt and stream the turn
    Prompt {
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Historical session id to resume
        #[arg(long)]
        resume: Option<String>,
        /// Do not persist a log for a new session
        #[arg(long, conflicts_with = "resume")]
        no_session: bool,
        message: String,
    },
    /// Inspect or refresh stored credentials
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AuthCommand {
    /// Show providers and expiry (never secrets)
    Status,
    /// Refresh one provider's OAuth token if expired
    Refresh { provider: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pi_island=info,pi_island_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match cli.config.clone().or_else(pi_island_core::paths::config_file) {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::default(),
    };
    config.apply_env();
    if let Some(agent) = &cli.agent {
        config.agent_program.clone_from(agent);
    }
    if let Some(dir) = &cli.sessions_dir {
        config.sessions_dir.clone_from(dir);
    }
    if let Some(secs) = cli.timeout_secs {
        config.response_timeout_secs = secs;
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn start_manager(config: &AppConfig, manager: ManagerConfig) -> SessionManagerHandle {
    let launcher = ProcessLauncher::from_path(&config.agent_program, config.response_timeout());
    tracing::debug!(program = %launcher.program().display(), "agent resolved");
    SessionManager::start(manager, Arc::new(launcher))
}

async fn cmd_sessions(config: &AppConfig, per_project: Option<usize>) -> Result<()> {
    let per_project = per_project.unwrap_or(config.startup_files_per_project);
    let now = Utc::now();
    let window = chrono::Duration::seconds(config.activity_window_secs);
    let mut sessions = load_recent_sessions(&config.sessions_dir, per_project).await;
    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    let summaries: Vec<SessionSummary> = sessions
        .iter()
        .map(|s| SessionSummary::from_session(s, now, window))
        .collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

async fn cmd_watch(config: &AppConfig) -> Result<()> {
    let handle = start_manager(config, config.manager_config());
    let mut events = handle.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_json(&event)?,
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event consumer lagging"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; shutting down");
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn cmd_prompt(
    config: &AppConfig,
    cwd: Option<PathBuf>,
    resume: Option<String>,
    no_session: bool,
    message: String,
) -> Result<()> {
    let manager = ManagerConfig {
        watch: false,
        load_history: false,
        no_session,
        ..config.manager_config()
    };
    let handle = start_manager(config, manager);
    let mut events = handle.subscribe();

    let session_id = match resume {
        Some(id) => {
            let loaded = handle.load_history().await?;
            tracing::debug!(loaded, "history loaded for resume");
            handle
                .resume(&id)
                .await
                .with_context(|| format!("cannot resume session {id}"))?
        }
        None => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir().context("no working directory")?,
            };
            handle.create(cwd).await?
        }
    };

    let result = drive_turn(&handle, &mut events, &session_id, message).await;
    if let Err(e) = handle.stop(&session_id).await {
        tracing::debug!(error = %e, "session already gone");
    }
    handle.shutdown().await?;
    result
}

/// Wait for the session to become idle, prompt it, and stream events until
/// the turn ends.
async fn drive_turn(
    handle: &SessionManagerHandle,
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    session_id: &str,
    message: String,
) -> Result<()> {
    let mut prompted = false;
    let mut turn_started = false;

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event consumer lagging");
                    continue;
                }
                Err(RecvError::Closed) => bail!("session manager stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = handle.abort(session_id).await;
                bail!("interrupted");
            }
        };

        let summary = match &event {
            SessionEvent::SessionAdded { session } | SessionEvent::SessionUpdated { session }
                if session.id == session_id =>
            {
                session.clone()
            }
            _ => continue,
        };
        print_json(&event)?;

        match &summary.phase {
            SessionPhase::Error(message) => bail!("session failed: {message}"),
            SessionPhase::Disconnected => bail!("agent exited"),
            SessionPhase::Idle if !prompted => {
                handle.prompt(session_id, message.clone()).await?;
                prompted = true;
            }
            SessionPhase::Thinking | SessionPhase::Executing if prompted => turn_started = true,
            SessionPhase::Idle if turn_started && !summary.is_streaming => return Ok(()),
            _ => {}
        }
    }
}

async fn cmd_auth(config: &AppConfig, command: AuthCommand) -> Result<()> {
    let store = CredentialStore::new(&config.auth_file);
    match command {
        AuthCommand::Status => {
            let now = Utc::now().timestamp_millis();
            let rows: Vec<serde_json::Value> = store
                .load()
                .await?
                .iter()
                .map(|(provider, credential)| match credential {
                    Credential::OAuth(c) => serde_json::json!({
                        "provider": provider,
                        "type": "oauth",
                        "expires": c.expires,
                        "expired": c.is_expired(now),
                        "refreshable": config.oauth.contains_key(provider),
                    }),
                    Credential::ApiKey { .. } => serde_json::json!({
                        "provider": provider,
                        "type": "api_key",
                    }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        AuthCommand::Refresh { provider } => {
            let refresher = CredentialRefresher::new(
                store,
                Arc::new(StaticClientConfigSource::new(config.oauth.clone())),
                Arc::new(HttpTokenRefresher::default()),
            );
            let Some(credential) = refresher.ensure_fresh(&provider).await else {
                bail!("could not obtain a fresh credential for {provider}");
            };
            print_json(&serde_json::json!({
                "provider": provider,
                "expires": credential.expires,
            }))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Sessions { per_project } => cmd_sessions(&config, per_project).await,
        Command::Watch => cmd_watch(&config).await,
        Command::Prompt {
            cwd,
            resume,
            no_session,
            message,
        } => cmd_prompt(&config, cwd, resume, no_session, message).await,
        Command::Auth { command } => cmd_auth(&config, command).await,
    }
}
