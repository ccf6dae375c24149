//! Credential provider: cached OAuth credentials read from the secret store,
//! expiry detection, and refresh-token exchange with write-back.
//!
//! The secret store holds the same JSON document the Claude CLI writes:
//!
//! ```json
//! {
//!   "claudeAiOauth": {
//!     "accessToken": "...",
//!     "refreshToken": "...",
//!     "expiresAt": 1735000000000,
//!     "subscriptionType": "max"
//!   }
//! }
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::OAUTH_CLIENT_ID;
use crate::error::{CredentialError, RefreshError, StoreError};
use crate::keychain::SecretStore;

/// Tokens are treated as expired this long before their real expiry
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(120);

/// Cached credentials older than this are re-read from the store
pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Checked top to bottom; the first marker contained in the subscription type wins.
pub const PLAN_TIERS: &[(&str, &str)] = &[
    ("20x", "Claude Max 20x"),
    ("5x", "Claude Max 5x"),
    ("max_200", "Claude Max $200"),
    ("max_100", "Claude Max $100"),
    ("max", "Claude Max"),
    ("pro", "Claude Pro"),
    ("team", "Claude Team"),
    ("enterprise", "Claude Enterprise"),
    ("free", "Claude Free"),
];

pub fn plan_label(subscription_type: &str) -> String {
    let lowered = subscription_type.to_lowercase();

    PLAN_TIERS
        .iter()
        .find(|(marker, _)| lowered.contains(marker))
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| {
            if subscription_type.is_empty() {
                "Unknown".to_string()
            } else {
                subscription_type.to_string()
            }
        })
}

#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub access_token: String,
    /// Empty when the store has none
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub plan_label: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &!self.refresh_token.is_empty())
            .field("expires_at", &self.expires_at)
            .field("plan_label", &self.plan_label)
            .finish()
    }
}

impl Credentials {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expired once `now` is within the safety buffer of `expires_at`.
    /// Credentials without an expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let buffer = chrono::Duration::from_std(EXPIRY_BUFFER).unwrap_or_default();
                now >= expires_at - buffer
            }
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    claude_ai_oauth: OAuthData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthData {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<f64>,
    subscription_type: Option<String>,
}

/// Parse the secret store payload
pub fn parse_credentials(raw: &str) -> Result<Credentials, CredentialError> {
    let file: CredentialsFile = serde_json::from_str(raw.trim())
        .map_err(|e| CredentialError::Malformed(e.to_string()))?;
    let oauth = file.claude_ai_oauth;

    let expires_at = oauth
        .expires_at
        .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single());

    Ok(Credentials {
        access_token: oauth.access_token,
        refresh_token: oauth.refresh_token.unwrap_or_default(),
        expires_at,
        plan_label: plan_label(oauth.subscription_type.as_deref().unwrap_or("")),
    })
}

#[derive(Debug, Clone)]
pub struct CachedCredentialState {
    pub value: Credentials,
    pub fetched_at: Instant,
}

impl CachedCredentialState {
    fn is_usable(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < CACHE_TTL && !self.value.is_expired()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Owns the credential cache. Shared between the coordination loop and the
/// fetch task through an `Arc`; refresh exchanges are serialized.
pub struct CredentialProvider {
    store: Arc<dyn SecretStore>,
    service: String,
    account: String,
    client: reqwest::Client,
    token_url: String,
    cache: Mutex<Option<CachedCredentialState>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl CredentialProvider {
    pub fn new(
        store: Arc<dyn SecretStore>,
        service: impl Into<String>,
        account: impl Into<String>,
        client: reqwest::Client,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            service: service.into(),
            account: account.into(),
            client,
            token_url: token_url.into(),
            cache: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Keyed by the current OS account name
    pub fn for_current_user(
        store: Arc<dyn SecretStore>,
        service: impl Into<String>,
        client: reqwest::Client,
        token_url: impl Into<String>,
    ) -> Self {
        Self::new(store, service, whoami::username(), client, token_url)
    }

    pub async fn obtain(&self, force_refresh: bool) -> Result<Credentials, CredentialError> {
        if !force_refresh && let Some(cached) = self.cached() {
            return Ok(cached);
        }

        let raw = self.read_entry().await?.ok_or(CredentialError::NoCredentials)?;
        let credentials = parse_credentials(&raw)?;

        debug!(
            plan = %credentials.plan_label,
            expired = credentials.is_expired(),
            "Loaded credentials from secret store"
        );

        self.lock_cache().replace(CachedCredentialState {
            value: credentials.clone(),
            fetched_at: Instant::now(),
        });

        Ok(credentials)
    }

    /// Drop the cached value so the next `obtain` re-reads the store
    pub fn invalidate(&self) {
        if self.lock_cache().take().is_some() {
            debug!("Credential cache invalidated");
        }
    }

    /// Exchange a refresh token and write the new token set back to the store.
    /// Network, status and parse failures leave the store untouched.
    pub async fn refresh(&self, refresh_token: &str) -> Result<(), RefreshError> {
        if refresh_token.is_empty() {
            return Err(RefreshError::MissingRefreshToken);
        }

        let _guard = self.refresh_lock.lock().await;

        info!("Refreshing OAuth access token");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", OAUTH_CLIENT_ID),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() != 200 {
            warn!(status = status.as_u16(), "Token refresh rejected");
            return Err(RefreshError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;
        let tokens: TokenResponse =
            serde_json::from_str(&body).map_err(|e| RefreshError::Parse(e.to_string()))?;

        self.write_back(&tokens, refresh_token).await?;
        self.invalidate();

        info!(
            expires_in_secs = tokens.expires_in,
            rotated = tokens.refresh_token.is_some(),
            "Access token refreshed"
        );
        Ok(())
    }

    /// Read-merge-delete-add. Not atomic: an interruption between delete and add
    /// leaves no entry, which surfaces later as a missing-token failure.
    async fn write_back(&self, tokens: &TokenResponse, old_refresh: &str) -> Result<(), RefreshError> {
        let current = self.read_entry_raw().await?;

        let mut root = current
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw.trim()).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        let oauth = root
            .entry("claudeAiOauth")
            .or_insert_with(|| Value::Object(Map::new()));
        if !oauth.is_object() {
            *oauth = Value::Object(Map::new());
        }
        if let Value::Object(fields) = oauth {
            fields.insert("accessToken".into(), json!(tokens.access_token));
            fields.insert(
                "refreshToken".into(),
                json!(tokens.refresh_token.as_deref().unwrap_or(old_refresh)),
            );
            // no expires_in means the new token does not expire
            match tokens.expires_in {
                Some(expires_in) => {
                    let expires_at = Utc::now().timestamp_millis() + expires_in * 1000;
                    fields.insert("expiresAt".into(), json!(expires_at));
                }
                None => {
                    fields.remove("expiresAt");
                }
            }
        }

        let merged = Value::Object(root).to_string();

        let store = Arc::clone(&self.store);
        let service = self.service.clone();
        let account = self.account.clone();
        tokio::task::spawn_blocking(move || {
            store.delete(&service, &account)?;
            store.add(&service, &account, &merged)
        })
        .await
        .map_err(|e| StoreError::Platform(e.to_string()))??;

        Ok(())
    }

    fn cached(&self) -> Option<Credentials> {
        let cache = self.lock_cache();
        cache
            .as_ref()
            .filter(|state| state.is_usable(Instant::now()))
            .map(|state| state.value.clone())
    }

    async fn read_entry(&self) -> Result<Option<String>, CredentialError> {
        self.read_entry_raw().await.map_err(CredentialError::from)
    }

    async fn read_entry_raw(&self) -> Result<Option<String>, StoreError> {
        let store = Arc::clone(&self.store);
        let service = self.service.clone();
        let account = self.account.clone();
        tokio::task::spawn_blocking(move || store.get(&service, &account))
            .await
            .map_err(|e| StoreError::Platform(e.to_string()))?
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<CachedCredentialState>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn age_cache(&self, by: Duration) {
        if let Some(state) = self.lock_cache().as_mut()
            && let Some(earlier) = state.fetched_at.checked_sub(by)
        {
            state.fetched_at = earlier;
        }
    }
}
