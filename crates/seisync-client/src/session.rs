//! Credential and session management.
//!
//! [`SessionManager`] owns the SEI token. Callers ask for a token; the
//! manager logs in when there is none or when it is about to expire, and
//! collapses concurrent refreshes into one login call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{extract_message, ApiError, ApiResult};
use crate::types::value_text;
use crate::units::{Unit, UnitDirectory};

/// Login endpoint, relative to the base URL.
pub const LOGIN_PATH: &str = "/v1/orgaos/usuarios/login";

/// An authenticated session. In memory only.
#[derive(Debug)]
pub struct AuthSession {
    pub token: String,
    /// Assumed expiry; the API does not report one.
    pub expires_at: Instant,
    pub units: Arc<UnitDirectory>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "Token")]
    token: Option<String>,
    #[serde(rename = "Unidades", default)]
    units: Vec<JsonValue>,
}

/// Owns the token lifecycle with single-flight refresh.
pub struct SessionManager {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    current: RwLock<Option<Arc<AuthSession>>>,
    refresh: Mutex<()>,
    logins: AtomicU64,
}

impl SessionManager {
    pub fn new(http: reqwest::Client, config: Arc<ClientConfig>) -> Self {
        Self {
            http,
            config,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            logins: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn is_fresh(&self, session: &AuthSession) -> bool {
        Instant::now() + self.config.token_refresh_margin < session.expires_at
    }

    /// A session whose token is valid, logging in if needed.
    ///
    /// Concurrent callers that find the session stale wait on one refresh
    /// and share its result.
    pub async fn session(&self) -> ApiResult<Arc<AuthSession>> {
        if let Some(session) = self.current.read().await.as_ref() {
            if self.is_fresh(session) {
                return Ok(session.clone());
            }
        }

        let _refreshing = self.refresh.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(session) = self.current.read().await.as_ref() {
            if self.is_fresh(session) {
                return Ok(session.clone());
            }
        }

        let session = Arc::new(self.login().await?);
        *self.current.write().await = Some(session.clone());
        Ok(session)
    }

    /// A currently valid token.
    pub async fn token(&self) -> ApiResult<String> {
        Ok(self.session().await?.token.clone())
    }

    /// Units of the current session.
    pub async fn units(&self) -> ApiResult<Arc<UnitDirectory>> {
        Ok(self.session().await?.units.clone())
    }

    /// Discard the session if it still holds `token`, forcing the next
    /// caller to log in. A token already replaced by a refresh is ignored.
    pub async fn invalidate(&self, token: &str) {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|s| s.token == token) {
            debug!(subsystem = "sei", component = "session", op = "invalidate", "Session invalidated");
            *current = None;
        }
    }

    /// Number of login calls made so far.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    async fn login(&self) -> ApiResult<AuthSession> {
        let start = Instant::now();
        self.logins.fetch_add(1, Ordering::SeqCst);
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), LOGIN_PATH);

        let response = self
            .http
            .post(&url)
            .json(&json!({
                "Usuario": self.config.username,
                "Senha": self.config.password,
                "Orgao": self.config.organ,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = match status.as_u16() {
                429 => ApiError::RateLimited,
                500..=599 => ApiError::from_response(status, &body),
                _ => ApiError::Auth(format!("HTTP {}: {}", status.as_u16(), extract_message(&body))),
            };
            warn!(
                subsystem = "sei",
                component = "session",
                op = "login",
                status = status.as_u16(),
                error = %err,
                "Login failed"
            );
            return Err(err);
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Auth(format!("unreadable login response: {}", e)))?;
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Auth("login response carries no token".to_string()))?;
        let units: Vec<Unit> = body
            .units
            .iter()
            .filter_map(|u| {
                let id = value_text(u, "Id", &[])?;
                let label = value_text(u, "Sigla", &[])?;
                Some(Unit::new(id, label))
            })
            .collect();

        info!(
            subsystem = "sei",
            component = "session",
            op = "login",
            units = units.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Authenticated with SEI API"
        );

        Ok(AuthSession {
            token,
            expires_at: Instant::now() + self.config.token_ttl,
            units: Arc::new(UnitDirectory::new(units)),
        })
    }
}
