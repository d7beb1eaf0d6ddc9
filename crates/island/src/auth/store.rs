// crates/island/src/auth/store.rs
//! The agent's JSON credential file: one entry per provider.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use super::AuthError;

/// An OAuth credential block. Provider-specific fields are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access: String,
    pub refresh: String,
    /// Expiry, epoch milliseconds.
    pub expires: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OAuthCredential {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires <= now_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    #[serde(rename = "oauth")]
    OAuth(OAuthCredential),
    ApiKey { key: String },
}

impl Credential {
    pub fn as_oauth(&self) -> Option<&OAuthCredential> {
        match self {
            Credential::OAuth(c) => Some(c),
            Credential::ApiKey { .. } => None,
        }
    }
}

pub type Credentials = BTreeMap<String, Credential>;

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every credential. A missing file is an empty store.
    pub async fn load(&self) -> Result<Credentials, AuthError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Credentials::new()),
            Err(source) => {
                return Err(AuthError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Credentials::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| AuthError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn get(&self, provider: &str) -> Result<Option<Credential>, AuthError> {
        Ok(self.load().await?.remove(provider))
    }

    /// Write the whole store via a temp file and rename, owner-only.
    pub async fn save(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let io_err = |source| AuthError::Io {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(credentials).map_err(|source| AuthError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        write_private(&tmp, &json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }

    /// Replace one provider's entry, keeping the others.
    pub async fn update(&self, provider: &str, credential: Credential) -> Result<(), AuthError> {
        let mut all = self.load().await?;
        all.insert(provider.to_string(), credential);
        self.save(&all).await
    }
}

/// Create `path` owner-only from the first byte, replacing any leftover.
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}
