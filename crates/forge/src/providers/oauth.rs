use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::errors::{ForgeError, ForgeResult};

pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";
pub const ACCOUNT_FILE_ENV: &str = "CLAUDE_ACCOUNT_FILE";

/// Refresh when less than this much lifetime remains
const REFRESH_WINDOW_MS: i64 = 5 * 60 * 1000;
/// Expiry values below this are unix seconds rather than milliseconds
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Credentials borrowed from a locally logged-in CLI account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedCredential {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Unix time, seconds or milliseconds; zero when unknown
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Deserialize)]
struct AccountFile {
    #[serde(rename = "claudeAiOauth")]
    oauth: Option<DelegatedCredential>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
}

pub fn normalize_expiry(expires_at: i64) -> i64 {
    if expires_at > 0 && expires_at < MILLIS_THRESHOLD {
        expires_at * 1000
    } else {
        expires_at
    }
}

impl DelegatedCredential {
    pub fn new<A: Into<String>, R: Into<String>>(access: A, refresh: R, expires_at: i64) -> Self {
        Self {
            access_token: access.into(),
            refresh_token: refresh.into(),
            expires_at,
        }
    }

    /// Whether a refresh should be attempted at `now_ms`. Without a refresh
    /// token nothing can be done; an unknown expiry is trusted while a token
    /// is present.
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        if self.refresh_token.is_empty() {
            return false;
        }
        let expires_at = normalize_expiry(self.expires_at);
        if expires_at == 0 {
            return self.access_token.is_empty();
        }
        now_ms >= expires_at - REFRESH_WINDOW_MS
    }
}

/// Holds the delegated credential and refreshes it on demand.
///
/// The lock is held across the expiry check and the refresh exchange, so
/// concurrent callers observe either the old or the new credential and at
/// most one refresh runs for a given expiry.
pub struct CredentialStore {
    state: Mutex<DelegatedCredential>,
    client: Client,
    token_endpoint: String,
}

impl CredentialStore {
    pub fn new(credential: DelegatedCredential) -> Self {
        Self {
            state: Mutex::new(credential),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
        }
    }

    pub fn with_token_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Load the `claudeAiOauth` section of an account file
    pub fn from_account_file(path: &Path) -> ForgeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ForgeError::Credential(format!("reading account file {}: {}", path.display(), e))
        })?;
        let account: AccountFile = serde_json::from_str(&raw)
            .map_err(|e| ForgeError::Credential(format!("parsing account file: {}", e)))?;
        let credential = account
            .oauth
            .ok_or_else(|| ForgeError::Credential("no claudeAiOauth in account file".into()))?;
        Ok(Self::new(credential))
    }

    pub async fn has_token(&self) -> bool {
        !self.state.lock().await.access_token.is_empty()
    }

    pub async fn snapshot(&self) -> DelegatedCredential {
        self.state.lock().await.clone()
    }

    /// Refresh the credential when it is within the refresh window.
    ///
    /// A failed exchange is tolerated while an access token is cached; the
    /// stale token is used and the vendor gets to reject it.
    pub async fn refresh_if_needed(&self) -> ForgeResult<()> {
        let mut state = self.state.lock().await;
        if !state.needs_refresh(Utc::now().timestamp_millis()) {
            return Ok(());
        }

        tracing::debug!("refreshing delegated credential");
        let refresh_token = state.refresh_token.clone();
        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await;

        let failure = match response {
            Ok(response) if response.status() == StatusCode::OK => {
                match response.json::<TokenResponse>().await {
                    Ok(token) => {
                        if !token.access_token.is_empty() {
                            state.access_token = token.access_token;
                        }
                        if !token.refresh_token.is_empty() {
                            state.refresh_token = token.refresh_token;
                        }
                        if token.expires_in > 0 {
                            state.expires_at =
                                Utc::now().timestamp_millis() + token.expires_in * 1000;
                        }
                        return Ok(());
                    }
                    Err(e) => format!("decoding token response: {}", e),
                }
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                format!("OAuth refresh failed ({}): {}", status, body)
            }
            Err(e) => format!("OAuth refresh request: {}", e),
        };

        if state.access_token.is_empty() {
            return Err(ForgeError::Credential(failure));
        }
        tracing::warn!("{failure}; continuing with cached access token");
        Ok(())
    }

    /// A usable access token, refreshed first when needed
    pub async fn access_token(&self) -> ForgeResult<String> {
        self.refresh_if_needed().await?;
        let state = self.state.lock().await;
        if state.access_token.is_empty() {
            return Err(ForgeError::Credential("no access token available".into()));
        }
        Ok(state.access_token.clone())
    }
}

/// Locate the active delegated account file: the env override first, then
/// the account named in `~/.claude/current-account.txt`.
pub fn find_account_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ACCOUNT_FILE_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::home_dir().and_then(|home| find_account_file_in(&home))
}

pub fn find_account_file_in(home: &Path) -> Option<PathBuf> {
    let claude_dir = home.join(".claude");
    let current = std::fs::read_to_string(claude_dir.join("current-account.txt")).ok()?;
    let current = current.trim();
    if current.is_empty() {
        return None;
    }
    let account = claude_dir.join("accounts").join(format!("{}.json", current));
    account.is_file().then_some(account)
}
