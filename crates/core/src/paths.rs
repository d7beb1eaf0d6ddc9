//! Default locations for everything the island reads.
//!
//! The agent owns `~/.pi/agent/`; we only ever read sessions from it and
//! rewrite the credential file under a lock.

use std::path::PathBuf;

/// Agent home: `~/.pi/agent/`.
pub fn agent_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".pi").join("agent"))
}

/// Sessions root: `~/.pi/agent/sessions/`, one subdirectory per project.
pub fn sessions_dir() -> Option<PathBuf> {
    agent_dir().map(|d| d.join("sessions"))
}

/// Credential store: `~/.pi/agent/auth.json`.
pub fn auth_file() -> Option<PathBuf> {
    agent_dir().map(|d| d.join("auth.json"))
}

/// Island config: `~/.config/pi-island/config.toml`.
pub fn config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pi-island").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_dir() {
        let Some(dir) = sessions_dir() else { return };
        assert!(dir.ends_with(".pi/agent/sessions"));
    }

    #[test]
    fn test_auth_file() {
        let Some(path) = auth_file() else { return };
        assert!(path.ends_with("agent/auth.json"));
    }

    #[test]
    fn test_config_file() {
        let Some(path) = config_file() else { return };
        assert!(path.to_string_lossy().contains("pi-island"));
        assert!(path.ends_with("config.toml"));
    }
}
