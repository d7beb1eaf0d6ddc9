// crates/island/src/auth/mod.rs
//! Credential store boundary: the agent's `auth.json`, a cross-process lock
//! around it, and OAuth refresh.

pub mod lock;
pub mod refresh;
pub mod store;

use std::path::PathBuf;

use thiserror::Error;

pub use lock::{FileLock, LockError, LockOptions};
pub use refresh::{
    ClientConfigSource, CredentialRefresher, HttpTokenRefresher, OAuthClientConfig,
    RefreshedTokens, StaticClientConfigSource, TokenEncoding, TokenRefresher,
};
pub use store::{Credential, CredentialStore, Credentials, OAuthCredential};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed credential file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No OAuth credential for {0}")]
    NoCredential(String),

    #[error("No OAuth client configured for {0}")]
    NoClientConfig(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
