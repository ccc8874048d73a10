//! SEI client configuration.

use std::time::Duration;

use seisync_core::{defaults, Error, Result};

use crate::transport::RetryPolicy;

/// Connection, credential and throttling settings for the SEI API.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL without the `/v1` prefix.
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Organ code sent with the login (`Orgao`).
    pub organ: String,
    /// Unit id used when a scope label resolves to no known unit.
    pub default_unit: Option<String>,
    pub timeout: Duration,
    /// Permit pool size for metadata calls.
    pub max_concurrent: usize,
    /// Permit pool size for document downloads.
    pub max_concurrent_downloads: usize,
    pub retry: RetryPolicy,
    /// Assumed token lifetime.
    pub token_ttl: Duration,
    /// Refresh this long before the assumed expiry.
    pub token_refresh_margin: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::SEI_BASE_URL.to_string(),
            username: String::new(),
            password: String::new(),
            organ: String::new(),
            default_unit: None,
            timeout: Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS),
            max_concurrent: defaults::MAX_CONCURRENT_REQUESTS,
            max_concurrent_downloads: defaults::MAX_CONCURRENT_DOWNLOADS,
            retry: RetryPolicy::default(),
            token_ttl: Duration::from_secs(defaults::TOKEN_TTL_SECS),
            token_refresh_margin: Duration::from_secs(defaults::TOKEN_REFRESH_MARGIN_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SEI_API_BASE_URL` | `https://api.sei.pi.gov.br` |
    /// | `SEI_API_USER` | (required) |
    /// | `SEI_API_PASSWORD` | (required) |
    /// | `SEI_API_ORGAO` | (required) |
    /// | `SEI_API_ID_UNIDADE` | none |
    /// | `SEI_API_TIMEOUT_SECS` | 30 |
    /// | `SEI_API_MAX_CONCURRENT` | 10 |
    /// | `SEI_API_MAX_CONCURRENT_DOWNLOADS` | 5 |
    /// | `SEI_API_MAX_ATTEMPTS` | 3 |
    /// | `SEI_API_BACKOFF_BASE_MS` | 2000 |
    /// | `SEI_API_BACKOFF_MAX_MS` | 10000 |
    /// | `SEI_API_RATE_LIMIT_COOLDOWN_MS` | 5000 |
    /// | `SEI_API_TOKEN_TTL_SECS` | 3600 |
    /// | `SEI_API_TOKEN_REFRESH_MARGIN_SECS` | 300 |
    ///
    /// Call [`validate`](Self::validate) before use.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_parse("SEI_API_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
            backoff_base: env_parse("SEI_API_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.backoff_base),
            backoff_max: env_parse("SEI_API_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.backoff_max),
            rate_limit_cooldown: env_parse("SEI_API_RATE_LIMIT_COOLDOWN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.rate_limit_cooldown),
        };

        Self {
            base_url: std::env::var("SEI_API_BASE_URL").unwrap_or(defaults.base_url),
            username: std::env::var("SEI_API_USER").unwrap_or_default(),
            password: std::env::var("SEI_API_PASSWORD").unwrap_or_default(),
            organ: std::env::var("SEI_API_ORGAO").unwrap_or_default(),
            default_unit: std::env::var("SEI_API_ID_UNIDADE")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            timeout: env_parse("SEI_API_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_concurrent: env_parse("SEI_API_MAX_CONCURRENT").unwrap_or(defaults.max_concurrent),
            max_concurrent_downloads: env_parse("SEI_API_MAX_CONCURRENT_DOWNLOADS")
                .unwrap_or(defaults.max_concurrent_downloads),
            retry,
            token_ttl: env_parse("SEI_API_TOKEN_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.token_ttl),
            token_refresh_margin: env_parse("SEI_API_TOKEN_REFRESH_MARGIN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.token_refresh_margin),
        }
    }

    /// Configuration for a service at `base_url` with the given credentials.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        organ: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            organ: organ.into(),
            ..Default::default()
        }
    }

    pub fn with_default_unit(mut self, unit: impl Into<String>) -> Self {
        self.default_unit = Some(unit.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_max_concurrent_downloads(mut self, n: usize) -> Self {
        self.max_concurrent_downloads = n;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration, refresh_margin: Duration) -> Self {
        self.token_ttl = ttl;
        self.token_refresh_margin = refresh_margin;
        self
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("SEI_API_USER", &self.username),
            ("SEI_API_PASSWORD", &self.password),
            ("SEI_API_ORGAO", &self.organ),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} is empty", name)));
            }
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "SEI_API_BASE_URL must be an http(s) URL: {}",
                self.base_url
            )));
        }
        if self.max_concurrent == 0 || self.max_concurrent_downloads == 0 {
            return Err(Error::Config(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "SEI_API_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.token_refresh_margin >= self.token_ttl {
            return Err(Error::Config(
                "token refresh margin must be shorter than the token TTL".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ClientConfig {
        ClientConfig::new("https://sei.example", "user", "secret", "SEAD-PI")
    }

    #[test]
    fn test_default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, defaults::SEI_BASE_URL);
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_methods() {
        let config = valid()
            .with_default_unit("110000001")
            .with_max_concurrent(4)
            .with_max_concurrent_downloads(2)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.default_unit.as_deref(), Some("110000001"));
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let config = ClientConfig::new("https://sei.example", "", "secret", "SEAD-PI");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("SEI_API_USER"));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        assert!(valid().with_max_concurrent(0).validate().is_err());
        assert!(valid().with_max_concurrent_downloads(0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let retry = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(valid().with_retry(retry).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_margin_longer_than_ttl() {
        let config = valid().with_token_ttl(Duration::from_secs(60), Duration::from_secs(60));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let config = ClientConfig::new("ftp://sei", "u", "p", "o");
        assert!(config.validate().is_err());
    }
}
