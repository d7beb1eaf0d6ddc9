// crates/island/src/auth/refresh.rs
//! OAuth refresh-token grant, coordinated across processes.
//!
//! Refresh is best-effort: any failure (no client config, lock contention,
//! HTTP error) leaves the stored credential untouched and the caller treats
//! it as still expired.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::lock::{FileLock, LockOptions};
use super::store::{Credential, CredentialStore, OAuthCredential};
use super::AuthError;

/// Safety margin subtracted from the server-reported lifetime.
const EXPIRY_SKEW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenEncoding {
    #[default]
    Json,
    Form,
}

/// Where and as whom to refresh tokens for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub encoding: TokenEncoding,
}

/// Supplies client configuration per provider. `None` disables refresh for
/// that provider.
pub trait ClientConfigSource: Send + Sync {
    fn client_config(&self, provider: &str) -> Option<OAuthClientConfig>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticClientConfigSource {
    clients: HashMap<String, OAuthClientConfig>,
}

impl StaticClientConfigSource {
    pub fn new(clients: HashMap<String, OAuthClientConfig>) -> Self {
        Self { clients }
    }
}

impl ClientConfigSource for StaticClientConfigSource {
    fn client_config(&self, provider: &str) -> Option<OAuthClientConfig> {
        self.clients.get(provider).cloned()
    }
}

/// Result of a successful grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access: String,
    /// Some providers rotate the refresh token.
    pub refresh: Option<String>,
    pub expires: i64,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        client: &OAuthClientConfig,
        refresh_token: &str,
    ) -> Result<RefreshedTokens, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Seconds.
    expires_in: i64,
}

/// Refresh over HTTP with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        client: &OAuthClientConfig,
        refresh_token: &str,
    ) -> Result<RefreshedTokens, AuthError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("client_id", client.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = &client.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let request = self
            .client
            .post(&client.token_url)
            .timeout(std::time::Duration::from_secs(30));
        let request = match client.encoding {
            TokenEncoding::Json => {
                let body: serde_json::Map<String, Value> = params
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::from(*v)))
                    .collect();
                request.json(&body)
            }
            TokenEncoding::Form => request.form(&params),
        };

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let data: TokenResponse = resp.json().await?;
        Ok(RefreshedTokens {
            access: data.access_token,
            refresh: data.refresh_token,
            expires: expiry_from_now(data.expires_in, Utc::now().timestamp_millis()),
        })
    }
}

/// Absolute expiry for a lifetime in seconds, minus the safety margin.
pub fn expiry_from_now(expires_in_secs: i64, now_ms: i64) -> i64 {
    now_ms
        .saturating_add(expires_in_secs.saturating_mul(1000))
        .saturating_sub(EXPIRY_SKEW_MS)
}

/// Keeps OAuth credentials fresh for whoever asks.
#[derive(Clone)]
pub struct CredentialRefresher {
    store: CredentialStore,
    clients: Arc<dyn ClientConfigSource>,
    refresher: Arc<dyn TokenRefresher>,
    lock_options: LockOptions,
}

impl CredentialRefresher {
    pub fn new(
        store: CredentialStore,
        clients: Arc<dyn ClientConfigSource>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            store,
            clients,
            refresher,
            lock_options: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// A non-expired OAuth credential for `provider`, refreshing if needed.
    /// `None` when there is none or the refresh failed.
    pub async fn ensure_fresh(&self, provider: &str) -> Option<OAuthCredential> {
        match self.try_ensure_fresh(provider).await {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!(provider, error = %e, "credential refresh failed");
                None
            }
        }
    }

    async fn try_ensure_fresh(&self, provider: &str) -> Result<OAuthCredential, AuthError> {
        let current = self.oauth(provider).await?;
        if !current.is_expired(Utc::now().timestamp_millis()) {
            return Ok(current);
        }

        let client = self
            .clients
            .client_config(provider)
            .ok_or_else(|| AuthError::NoClientConfig(provider.to_string()))?;

        let _lock = FileLock::acquire(self.store.path(), self.lock_options).await?;

        // Another process may have refreshed while we waited.
        let current = self.oauth(provider).await?;
        if !current.is_expired(Utc::now().timestamp_millis()) {
            debug!(provider, "credential refreshed by another process");
            return Ok(current);
        }

        let tokens = self.refresher.refresh(&client, &current.refresh).await?;
        let refreshed = OAuthCredential {
            access: tokens.access,
            refresh: tokens.refresh.unwrap_or(current.refresh),
            expires: tokens.expires,
            extra: current.extra,
        };
        self.store
            .update(provider, Credential::OAuth(refreshed.clone()))
            .await?;
        info!(provider, expires = refreshed.expires, "credential refreshed");
        Ok(refreshed)
    }

    async fn oauth(&self, provider: &str) -> Result<OAuthCredential, AuthError> {
        match self.store.get(provider).await? {
            Some(Credential::OAuth(c)) => Ok(c),
            _ => Err(AuthError::NoCredential(provider.to_string())),
        }
    }
}
