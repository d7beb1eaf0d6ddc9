// crates/island/src/rpc/error.rs
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the RPC client to its immediate caller.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Agent process is not running")]
    NotRunning,

    #[error("Failed to spawn agent {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {command} command: {source}")]
    Encode {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to agent stdin: {0}")]
    Write(#[source] std::io::Error),

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Connection closed before {command} completed")]
    Closed { command: String },
}

impl RpcError {
    pub fn spawn(program: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = RpcError::Timeout {
            command: "get_state".into(),
            after: Duration::from_secs(10),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "get_state timed out after 10s");
    }

    #[test]
    fn test_spawn_display() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file");
        let err = RpcError::spawn("/usr/bin/pi", io);
        assert!(err.to_string().contains("/usr/bin/pi"));
    }
}
