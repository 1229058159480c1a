//! Bearer token lifecycle for gateways running token-based firmware.
//!
//! The token is issued by the vendor cloud, cached on disk and renewed
//! shortly before it expires. Request code asks for the header on every
//! request so a rotation takes effect immediately.

use crate::error::{EnvoyError, Result};
use crate::persistence::write_atomically;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

pub const TOKEN_VALIDITY: Duration = Duration::from_secs(12 * 60 * 60);
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const FAILURE_RECHECK: Duration = Duration::from_secs(30);

const LOOP_TICK: Duration = Duration::from_secs(5);

/// The cached token document, `{"auth_token": "...", "created": 1700000000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub auth_token: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenStatus {
    Unchecked,
    Valid { refresh_at: DateTime<Utc> },
    Refreshing,
    RefreshFailed { retry_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
pub struct TokenSettings {
    pub validity: Duration,
    pub margin: Duration,
    pub check_interval: Duration,
    pub failure_recheck: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            validity: TOKEN_VALIDITY,
            margin: REFRESH_MARGIN,
            check_interval: CHECK_INTERVAL,
            failure_recheck: FAILURE_RECHECK,
        }
    }
}

/// Obtains a fresh token out of band.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<String>;
}

/// Logs into the vendor cloud and requests a token for one gateway serial.
pub struct EnlightenIssuer {
    client: reqwest::Client,
    login_url: String,
    token_url: String,
    username: String,
    password: String,
    serial: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    message: String,
    session_id: Option<String>,
}

impl EnlightenIssuer {
    pub fn new(
        login_url: impl Into<String>,
        token_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        serial: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            login_url: login_url.into(),
            token_url: token_url.into(),
            username: username.into(),
            password: password.into(),
            serial: serial.into(),
        }
    }
}

#[async_trait]
impl TokenIssuer for EnlightenIssuer {
    async fn issue(&self) -> Result<String> {
        let login = self
            .client
            .post(&self.login_url)
            .form(&[
                ("user[email]", self.username.as_str()),
                ("user[password]", self.password.as_str()),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let login: LoginResponse = expect_success("login", login)?.json().await?;

        let session_id = match (login.message.as_str(), login.session_id) {
            ("success", Some(session_id)) => session_id,
            (message, _) => return Err(EnvoyError::Auth(format!("login failed: {message}"))),
        };
        info!("Enlighten login succeeded");

        let response = self
            .client
            .post(&self.token_url)
            .json(&json!({
                "session_id": session_id,
                "serial_num": self.serial,
                "username": self.username,
            }))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let body = expect_success("token request", response)?.text().await?;

        // The token endpoint answers with the raw token; JSON means an error.
        if let Ok(document) = serde_json::from_str::<Value>(&body) {
            let message = document
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unexpected JSON answer");
            return Err(EnvoyError::Auth(format!("token request failed: {message}")));
        }
        let token = body.trim();
        if token.is_empty() {
            return Err(EnvoyError::Auth("token request returned nothing".into()));
        }
        Ok(token.to_string())
    }
}

/// Anything but 200 from the cloud is a failed refresh, whatever the body.
fn expect_success(step: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(EnvoyError::Auth(format!(
            "{step} answered with HTTP status {}",
            status.as_u16()
        )));
    }
    Ok(response)
}

#[derive(Debug, Clone)]
struct TokenState {
    token: Option<AuthToken>,
    status: TokenStatus,
    last_check: Option<DateTime<Utc>>,
    last_check_ok: Option<bool>,
    next_check: Option<DateTime<Utc>>,
}

/// Whether a call to [`TokenManager::check`] did anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Skipped,
    StillValid,
    Refreshed,
    Failed,
}

pub struct TokenManager {
    issuer: Box<dyn TokenIssuer>,
    token_file: PathBuf,
    settings: TokenSettings,
    state: RwLock<TokenState>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

impl TokenManager {
    /// Starts from the cached token file if it is readable.
    pub fn new(
        issuer: Box<dyn TokenIssuer>,
        token_file: impl Into<PathBuf>,
        settings: TokenSettings,
    ) -> Self {
        let token_file = token_file.into();
        let token = load_token_file(&token_file);
        if let Some(token) = &token {
            info!("Loaded cached token created {} UTC", token.created);
        }
        Self {
            issuer,
            token_file,
            settings,
            state: RwLock::new(TokenState {
                token,
                status: TokenStatus::Unchecked,
                last_check: None,
                last_check_ok: None,
                next_check: None,
            }),
        }
    }

    fn read_state(&self) -> Option<TokenState> {
        self.state.read().ok().map(|state| state.clone())
    }

    fn update_state(&self, update: impl FnOnce(&mut TokenState)) {
        if let Ok(mut state) = self.state.write() {
            update(&mut state);
        }
    }

    pub fn status(&self) -> TokenStatus {
        self.read_state()
            .map(|state| state.status)
            .unwrap_or(TokenStatus::Unchecked)
    }

    pub fn token(&self) -> Option<AuthToken> {
        self.read_state().and_then(|state| state.token)
    }

    pub fn last_check(&self) -> Option<(DateTime<Utc>, bool)> {
        let state = self.read_state()?;
        Some((state.last_check?, state.last_check_ok?))
    }

    /// `Authorization` header value for the current token.
    pub fn authorization_header(&self) -> Option<String> {
        self.token()
            .filter(|token| !token.auth_token.is_empty())
            .map(|token| format!("Bearer {}", token.auth_token))
    }

    /// The moment a token created at `created` should be renewed.
    pub fn refresh_at(&self, created: DateTime<Utc>) -> DateTime<Utc> {
        created + to_chrono(self.settings.validity) - to_chrono(self.settings.margin)
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.token() {
            Some(token) if !token.auth_token.is_empty() => now >= self.refresh_at(token.created),
            _ => true,
        }
    }

    pub fn is_check_due(&self, now: DateTime<Utc>) -> bool {
        match self.read_state().and_then(|state| state.next_check) {
            Some(next_check) => now >= next_check,
            None => true,
        }
    }

    /// Renews the token when it is close to expiry. A no-op until the next
    /// check is due.
    pub async fn check(&self, now: DateTime<Utc>) -> CheckOutcome {
        if !self.is_check_due(now) {
            return CheckOutcome::Skipped;
        }

        if !self.needs_refresh(now) {
            let refresh_at = self
                .token()
                .map(|token| self.refresh_at(token.created))
                .unwrap_or(now);
            self.update_state(|state| {
                state.status = TokenStatus::Valid { refresh_at };
                state.last_check = Some(now);
                state.last_check_ok = Some(true);
                state.next_check = Some(now + to_chrono(self.settings.check_interval));
            });
            return CheckOutcome::StillValid;
        }

        match self.token() {
            Some(token) => warn!("Token expired. Creation date: {} UTC", token.created),
            None => warn!("No token available, requesting one"),
        }
        self.update_state(|state| state.status = TokenStatus::Refreshing);

        match self.issuer.issue().await {
            Ok(auth_token) => {
                let token = AuthToken {
                    auth_token,
                    created: now,
                };
                if let Err(e) = self.persist(&token) {
                    error!("Could not write token cache {:?}: {e}", self.token_file);
                }
                let refresh_at = self.refresh_at(now);
                self.update_state(|state| {
                    state.token = Some(token);
                    state.status = TokenStatus::Valid { refresh_at };
                    state.last_check = Some(now);
                    state.last_check_ok = Some(true);
                    state.next_check = Some(now + to_chrono(self.settings.check_interval));
                });
                warn!("Token successfully requested. New creation date: {now} UTC");
                CheckOutcome::Refreshed
            }
            Err(e) => {
                let retry_at = now + to_chrono(self.settings.failure_recheck);
                error!("Token request failed: {e}. Retrying at {retry_at}");
                // Keep the previous token, it may still be accepted.
                self.update_state(|state| {
                    state.status = TokenStatus::RefreshFailed { retry_at };
                    state.last_check = Some(now);
                    state.last_check_ok = Some(false);
                    state.next_check = Some(retry_at);
                });
                CheckOutcome::Failed
            }
        }
    }

    fn persist(&self, token: &AuthToken) -> Result<()> {
        let document = serde_json::to_vec(token)?;
        write_atomically(&self.token_file, &document)
    }

    /// Background loop; checks are rate limited by [`Self::check`] itself.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        info!("Starting token manager");
        while shutdown.is_running() {
            self.check(Utc::now()).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(LOOP_TICK) => {}
            }
        }
        info!("Token manager exiting");
    }
}

fn load_token_file(path: &Path) -> Option<AuthToken> {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Ignoring unreadable token cache {path:?}: {e}");
                None
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Could not read token cache {path:?}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};

    struct FakeIssuer {
        calls: Arc<AtomicU32>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TokenIssuer for FakeIssuer {
        async fn issue(&self) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                Err(EnvoyError::Auth("cloud unavailable".into()))
            } else {
                Ok(format!("token-{call}"))
            }
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn manager(
        dir: &tempfile::TempDir,
        cached: Option<AuthToken>,
    ) -> (TokenManager, Arc<AtomicU32>, Arc<AtomicBool>) {
        let path = dir.path().join("auth_token.json");
        if let Some(token) = cached {
            fs::write(&path, serde_json::to_vec(&token).unwrap()).unwrap();
        }
        let calls = Arc::new(AtomicU32::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        let issuer = FakeIssuer {
            calls: calls.clone(),
            fail: fail.clone(),
        };
        (
            TokenManager::new(Box::new(issuer), path, TokenSettings::default()),
            calls,
            fail,
        )
    }

    #[tokio::test]
    async fn test_refresh_only_after_validity_minus_margin() {
        let dir = tempfile::tempdir().unwrap();
        let cached = AuthToken {
            auth_token: "cached".into(),
            created: t(0),
        };
        let (manager, calls, _) = manager(&dir, Some(cached));
        let threshold = 12 * 3600 - 5 * 60;

        assert_eq!(manager.check(t(threshold - 1)).await, CheckOutcome::StillValid);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.authorization_header().as_deref(), Some("Bearer cached"));
        assert_eq!(
            manager.status(),
            TokenStatus::Valid {
                refresh_at: t(threshold)
            }
        );

        // Within a minute of the last check nothing happens.
        assert_eq!(manager.check(t(threshold + 30)).await, CheckOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(manager.check(t(threshold + 59)).await, CheckOutcome::Refreshed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.authorization_header().as_deref(), Some("Bearer token-1"));

        let written: AuthToken =
            serde_json::from_slice(&fs::read(dir.path().join("auth_token.json")).unwrap()).unwrap();
        assert_eq!(written.auth_token, "token-1");
        assert_eq!(written.created, t(threshold + 59));
    }

    #[tokio::test]
    async fn test_missing_cache_requests_token() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, calls, _) = manager(&dir, None);

        assert!(manager.authorization_header().is_none());
        assert!(manager.needs_refresh(t(0)));
        assert_eq!(manager.check(t(0)).await, CheckOutcome::Refreshed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.last_check(), Some((t(0), true)));
    }

    #[tokio::test]
    async fn test_failure_keeps_token_and_rechecks_early() {
        let dir = tempfile::tempdir().unwrap();
        let cached = AuthToken {
            auth_token: "old".into(),
            created: t(-12 * 3600),
        };
        let (manager, calls, fail) = manager(&dir, Some(cached));
        fail.store(true, Ordering::SeqCst);

        assert_eq!(manager.check(t(0)).await, CheckOutcome::Failed);
        assert_eq!(manager.authorization_header().as_deref(), Some("Bearer old"));
        assert_eq!(manager.status(), TokenStatus::RefreshFailed { retry_at: t(30) });
        assert_eq!(manager.last_check(), Some((t(0), false)));

        assert_eq!(manager.check(t(29)).await, CheckOutcome::Skipped);
        fail.store(false, Ordering::SeqCst);
        assert_eq!(manager.check(t(30)).await, CheckOutcome::Refreshed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.authorization_header().as_deref(), Some("Bearer token-2"));
    }

    #[tokio::test]
    async fn test_enlighten_issuer() {
        let mut server = mockito::Server::new_async().await;
        let login = server
            .mock("POST", "/login/login.json")
            .match_body(mockito::Matcher::UrlEncoded(
                "user[email]".into(),
                "owner@example.com".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"success","session_id":"abc123"}"#)
            .create_async()
            .await;
        let tokens = server
            .mock("POST", "/tokens")
            .match_body(mockito::Matcher::PartialJson(json!({
                "session_id": "abc123",
                "serial_num": "122100000001"
            })))
            .with_status(200)
            .with_body("eyJraWQiOiJ0b2tlbiJ9.payload.signature")
            .create_async()
            .await;

        let issuer = EnlightenIssuer::new(
            format!("{}/login/login.json", server.url()),
            format!("{}/tokens", server.url()),
            "owner@example.com",
            "secret",
            "122100000001",
        );
        let token = issuer.issue().await.unwrap();
        assert_eq!(token, "eyJraWQiOiJ0b2tlbiJ9.payload.signature");
        login.assert_async().await;
        tokens.assert_async().await;
    }

    #[tokio::test]
    async fn test_enlighten_issuer_rejects_json_answer() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"message":"success","session_id":"abc123"}"#)
            .create_async()
            .await;
        let _tokens = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_body(r#"{"message":"Serial not commissioned"}"#)
            .create_async()
            .await;

        let issuer = EnlightenIssuer::new(
            format!("{}/login/login.json", server.url()),
            format!("{}/tokens", server.url()),
            "owner@example.com",
            "secret",
            "1",
        );
        let err = issuer.issue().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Authentication error: token request failed: Serial not commissioned"
        );
    }

    #[tokio::test]
    async fn test_enlighten_issuer_login_failure() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"message":"Invalid credentials"}"#)
            .create_async()
            .await;

        let issuer = EnlightenIssuer::new(
            format!("{}/login/login.json", server.url()),
            format!("{}/tokens", server.url()),
            "owner@example.com",
            "wrong",
            "1",
        );
        assert!(matches!(issuer.issue().await, Err(EnvoyError::Auth(_))));
    }

    #[tokio::test]
    async fn test_token_endpoint_outage_keeps_old_token() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"message":"success","session_id":"abc123"}"#)
            .create_async()
            .await;
        let tokens = server
            .mock("POST", "/tokens")
            .with_status(503)
            .with_body("<html><body>Service Unavailable</body></html>")
            .create_async()
            .await;

        let issuer = EnlightenIssuer::new(
            format!("{}/login/login.json", server.url()),
            format!("{}/tokens", server.url()),
            "owner@example.com",
            "secret",
            "1",
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_token.json");
        let cached = AuthToken {
            auth_token: "old".into(),
            created: t(-12 * 3600),
        };
        fs::write(&path, serde_json::to_vec(&cached).unwrap()).unwrap();
        let manager = TokenManager::new(Box::new(issuer), &path, TokenSettings::default());

        assert_eq!(manager.check(t(0)).await, CheckOutcome::Failed);
        assert_eq!(manager.authorization_header().as_deref(), Some("Bearer old"));
        assert_eq!(manager.status(), TokenStatus::RefreshFailed { retry_at: t(30) });
        let stored: AuthToken = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored, cached);
        tokens.assert_async().await;
    }

    #[tokio::test]
    async fn test_enlighten_issuer_login_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/login/login.json")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let issuer = EnlightenIssuer::new(
            format!("{}/login/login.json", server.url()),
            format!("{}/tokens", server.url()),
            "owner@example.com",
            "secret",
            "1",
        );
        let err = issuer.issue().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Authentication error: login answered with HTTP status 502"
        );
    }
}
