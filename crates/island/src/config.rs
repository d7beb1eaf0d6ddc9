// crates/island/src/config.rs
//! Application configuration: TOML file, then environment, then CLI flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::OAuthClientConfig;
use crate::live::ManagerConfig;

const DEFAULT_ACTIVITY_WINDOW_SECS: i64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent_program: String,
    pub sessions_dir: PathBuf,
    pub auth_file: PathBuf,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub response_timeout_secs: u64,
    pub watcher_latency_ms: u64,
    pub startup_files_per_project: usize,
    pub activity_window_secs: i64,
    pub oauth: HashMap<String, OAuthClientConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent_program: "pi".into(),
            sessions_dir: pi_island_core::paths::sessions_dir().unwrap_or_default(),
            auth_file: pi_island_core::paths::auth_file().unwrap_or_default(),
            default_provider: None,
            default_model: None,
            response_timeout_secs: 10,
            watcher_latency_ms: 100,
            startup_files_per_project: 3,
            activity_window_secs: DEFAULT_ACTIVITY_WINDOW_SECS,
            oauth: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `PI_ISLAND_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(agent) = get("PI_ISLAND_AGENT") {
            self.agent_program = agent;
        }
        if let Some(dir) = get("PI_ISLAND_SESSIONS_DIR") {
            self.sessions_dir = PathBuf::from(dir);
        }
        if let Some(file) = get("PI_ISLAND_AUTH_FILE") {
            self.auth_file = PathBuf::from(file);
        }
        match get("PI_ISLAND_TIMEOUT_SECS").map(|v| v.parse::<u64>()) {
            Some(Ok(secs)) => self.response_timeout_secs = secs,
            Some(Err(e)) => tracing::warn!(error = %e, "ignoring invalid PI_ISLAND_TIMEOUT_SECS"),
            None => {}
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            sessions_dir: self.sessions_dir.clone(),
            startup_files_per_project: self.startup_files_per_project,
            activity_window: self.activity_window(),
            watcher_latency: Duration::from_millis(self.watcher_latency_ms),
            watch: true,
            load_history: true,
            provider: self.default_provider.clone(),
            model: self.default_model.clone(),
            no_session: false,
        }
    }

    /// Recency window; out-of-range values fall back to the default.
    pub fn activity_window(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.activity_window_secs)
            .filter(|w| *w >= chrono::Duration::zero())
            .unwrap_or_else(|| {
                tracing::warn!(
                    value = self.activity_window_secs,
                    "activity_window_secs out of range; using default"
                );
                chrono::Duration::seconds(DEFAULT_ACTIVITY_WINDOW_SECS)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenEncoding;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.agent_program, "pi");
        assert_eq!(config.response_timeout(), Duration::from_secs(10));
        assert_eq!(config.startup_files_per_project, 3);
        assert!(config.oauth.is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
agent_program = "/opt/pi/bin/pi"
watcher_latency_ms = 250

[oauth.anthropic]
token_url = "https://auth.example/token"
client_id = "abc"
encoding = "form"
"#,
        )
        .unwrap();
        assert_eq!(config.agent_program, "/opt/pi/bin/pi");
        assert_eq!(config.watcher_latency_ms, 250);
        assert_eq!(config.response_timeout_secs, 10);
        let oauth = &config.oauth["anthropic"];
        assert_eq!(oauth.client_id, "abc");
        assert_eq!(oauth.encoding, TokenEncoding::Form);
        assert_eq!(oauth.client_secret, None);

        let manager = config.manager_config();
        assert_eq!(manager.watcher_latency, Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("config.toml");
        assert_eq!(AppConfig::load(&missing).unwrap(), AppConfig::default());

        std::fs::write(&missing, "response_timeout_secs = \"soon\"").unwrap();
        assert!(matches!(
            AppConfig::load(&missing),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_out_of_range_activity_window_falls_back() {
        let config = AppConfig::from_toml("activity_window_secs = 9223372036854775807").unwrap();
        assert_eq!(
            config.manager_config().activity_window,
            chrono::Duration::seconds(10)
        );

        let config = AppConfig::from_toml("activity_window_secs = -5").unwrap();
        assert_eq!(config.activity_window(), chrono::Duration::seconds(10));

        let config = AppConfig::from_toml("activity_window_secs = 30").unwrap();
        assert_eq!(config.activity_window(), chrono::Duration::seconds(30));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            ("PI_ISLAND_AGENT", "pi-dev"),
            ("PI_ISLAND_SESSIONS_DIR", "/tmp/sessions"),
            ("PI_ISLAND_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        config.apply_env_with(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.agent_program, "pi-dev");
        assert_eq!(config.sessions_dir, PathBuf::from("/tmp/sessions"));
        assert_eq!(config.response_timeout_secs, 10);
    }
}
