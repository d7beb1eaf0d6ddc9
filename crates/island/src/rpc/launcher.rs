// crates/island/src/rpc/launcher.rs
//! The seam between the session manager and an agent process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pi_island_core::RpcCommand;
use serde_json::Value;

use super::client::{AgentCommand, EventSender, RpcClient};
use super::error::RpcError;

/// Per-session launch parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub cwd: PathBuf,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Open this log directly (`--session`). The session manager resumes
    /// through `switch_session` instead; this is for direct launcher callers.
    pub session_file: Option<PathBuf>,
    /// Run without persisting a log (`--no-session`).
    pub no_session: bool,
}

impl LaunchOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    /// Command-line arguments for `pi`.
    pub fn agent_args(&self) -> Vec<String> {
        let mut args = vec!["--mode".to_string(), "rpc".to_string()];
        if let Some(provider) = &self.provider {
            args.push("--provider".into());
            args.push(provider.clone());
        }
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if self.no_session {
            args.push("--no-session".into());
        } else if let Some(file) = &self.session_file {
            args.push("--session".into());
            args.push(file.to_string_lossy().into_owned());
        }
        args
    }
}

/// A running agent the manager can talk to.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Fire-and-forget; effects arrive later as events.
    async fn send(&self, command: RpcCommand) -> Result<(), RpcError>;
    /// Correlated request, bounded by the response timeout.
    async fn request(&self, command: RpcCommand) -> Result<Option<Value>, RpcError>;
    async fn stop(&self);
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start an agent whose events are delivered, in order, on `events`.
    async fn launch(
        &self,
        options: &LaunchOptions,
        events: EventSender,
    ) -> Result<Arc<dyn AgentConnection>, RpcError>;
}

#[async_trait]
impl AgentConnection for RpcClient {
    async fn send(&self, command: RpcCommand) -> Result<(), RpcError> {
        RpcClient::send(self, command).await
    }

    async fn request(&self, command: RpcCommand) -> Result<Option<Value>, RpcError> {
        RpcClient::request(self, command).await
    }

    async fn stop(&self) {
        RpcClient::stop(self).await
    }
}

/// Launches `pi --mode rpc` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    response_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, response_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            response_timeout,
        }
    }

    /// Resolve `name` on `PATH`, falling back to the bare name.
    pub fn from_path(name: &str, response_timeout: Duration) -> Self {
        let program = match which::which(name) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!(program = name, error = %e, "agent not found on PATH");
                PathBuf::from(name)
            }
        };
        Self::new(program, response_timeout)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command(&self, options: &LaunchOptions) -> AgentCommand {
        AgentCommand {
            program: self.program.clone(),
            args: options.agent_args(),
            cwd: Some(options.cwd.clone()),
        }
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(
        &self,
        options: &LaunchOptions,
        events: EventSender,
    ) -> Result<Arc<dyn AgentConnection>, RpcError> {
        let client = RpcClient::spawn(&self.command(options), events, self.response_timeout)?;
        Ok(Arc::new(client))
    }
}
