//! Rate-limited retrying transport.
//!
//! Every outbound SEI call goes through [`Transport::call`], which
//! applies the permit pool, the token, error classification and the
//! retry policy in one loop:
//!
//! | Outcome | Action |
//! |---|---|
//! | 401 | invalidate the session, log in again, retry once |
//! | 429 | sleep the cooldown, retry (uncapped) |
//! | 5xx / timeout / network | exponential backoff up to `max_attempts` |
//! | not found, other 4xx | surface immediately |
//!
//! [`Transport::units`] applies the same 429 and backoff rules to the
//! login that fetches the unit directory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use seisync_core::defaults;

use crate::error::{ApiError, ApiResult};
use crate::session::{SessionManager, LOGIN_PATH};
use crate::stats::TransportStats;
use crate::units::UnitDirectory;

/// Header carrying the SEI token.
pub const TOKEN_HEADER: &str = "token";

/// Backoff and attempt limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call for retryable errors, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Fixed sleep after HTTP 429.
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_REQUEST_ATTEMPTS,
            backoff_base: Duration::from_millis(defaults::BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(defaults::BACKOFF_MAX_MS),
            rate_limit_cooldown: Duration::from_millis(defaults::RATE_LIMIT_COOLDOWN_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `failures` (1-based):
    /// `base * 2^(failures - 1)`, clamped to `backoff_max`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// An outbound request, relative to the service base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// A successful response with its body fully read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Bounded-concurrency, retrying HTTP transport bound to one session.
pub struct Transport {
    name: &'static str,
    http: reqwest::Client,
    base_url: String,
    session: Arc<SessionManager>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    stats: Arc<TransportStats>,
}

impl Transport {
    /// Create a transport with its own permit pool of `max_concurrent`.
    pub fn new(
        name: &'static str,
        http: reqwest::Client,
        session: Arc<SessionManager>,
        max_concurrent: usize,
    ) -> Self {
        let config = session.config();
        Self {
            name,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            policy: config.retry.clone(),
            http,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            stats: Arc::new(TransportStats::new()),
            session,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a request, retrying per the policy.
    pub async fn call(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
        let mut failures: u32 = 0;
        let mut reauthenticated = false;

        loop {
            let (result, token) = match self.session.token().await {
                Ok(token) => (self.attempt(request, &token).await, Some(token)),
                Err(e) => (Err(e), None),
            };

            let err = match result {
                Ok(response) => {
                    self.stats.record_success();
                    return Ok(response);
                }
                Err(err) => err,
            };
            self.stats.record_error(err.kind());

            match (&err, token) {
                (ApiError::Unauthorized(_), Some(token)) if !reauthenticated => {
                    reauthenticated = true;
                    self.stats.record_reauthentication();
                    debug!(
                        subsystem = "sei",
                        component = "transport",
                        transport = self.name,
                        path = %request.path,
                        "Token rejected, re-authenticating"
                    );
                    self.session.invalidate(&token).await;
                }
                _ => {
                    if !self.wait_to_retry(&err, &mut failures, &request.path).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// The session's unit directory, logging in under the same 429 and
    /// backoff rules as [`Transport::call`].
    pub async fn units(&self) -> ApiResult<Arc<UnitDirectory>> {
        let mut failures: u32 = 0;
        loop {
            let err = match self.session.units().await {
                Ok(units) => return Ok(units),
                Err(err) => err,
            };
            self.stats.record_error(err.kind());
            if !self.wait_to_retry(&err, &mut failures, LOGIN_PATH).await {
                return Err(err);
            }
        }
    }

    /// Sleep before the next attempt, or return false when `err` must
    /// surface. Rate limiting does not consume an attempt.
    async fn wait_to_retry(&self, err: &ApiError, failures: &mut u32, path: &str) -> bool {
        match err {
            ApiError::RateLimited => {
                self.stats.record_retry();
                warn!(
                    subsystem = "sei",
                    component = "transport",
                    transport = self.name,
                    path = %path,
                    cooldown_ms = self.policy.rate_limit_cooldown.as_millis() as u64,
                    "Rate limited, cooling down"
                );
                tokio::time::sleep(self.policy.rate_limit_cooldown).await;
                true
            }
            _ if err.is_retryable() => {
                *failures += 1;
                if *failures >= self.policy.max_attempts {
                    self.stats.record_failure();
                    warn!(
                        subsystem = "sei",
                        component = "transport",
                        transport = self.name,
                        path = %path,
                        attempt = *failures,
                        error = %err,
                        "Giving up after max attempts"
                    );
                    return false;
                }
                let delay = self.policy.backoff(*failures);
                self.stats.record_retry();
                warn!(
                    subsystem = "sei",
                    component = "transport",
                    transport = self.name,
                    path = %path,
                    attempt = *failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                true
            }
            _ => {
                self.stats.record_failure();
                false
            }
        }
    }

    /// One HTTP exchange under a permit. The permit is released before
    /// any retry sleep.
    async fn attempt(&self, request: &ApiRequest, token: &str) -> ApiResult<ApiResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ApiError::Network("transport permit pool closed".to_string()))?;
        let _in_flight = self.stats.begin();
        let start = Instant::now();

        let url = format!("{}{}", self.base_url, request.path);
        let result = async {
            let response = self
                .http
                .request(request.method.clone(), &url)
                .header(TOKEN_HEADER, token)
                .query(&request.query)
                .send()
                .await?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;

            if status.is_success() {
                Ok(ApiResponse {
                    status: status.as_u16(),
                    headers,
                    body,
                })
            } else {
                Err(ApiError::from_response(
                    status,
                    &String::from_utf8_lossy(&body),
                ))
            }
        }
        .await;

        self.stats.record_latency(start.elapsed());
        debug!(
            subsystem = "sei",
            component = "transport",
            transport = self.name,
            path = %request.path,
            ok = result.is_ok(),
            duration_ms = start.elapsed().as_millis() as u64,
            "SEI request"
        );
        result
    }
}
