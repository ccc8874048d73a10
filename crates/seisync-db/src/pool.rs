//! Postgres pool for the state store.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use seisync_core::{defaults, Error, Result};

/// Idle connections are closed after this long.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Sizing and timeouts of the state store pool.
///
/// Every in-flight item holds a connection only for the duration of a
/// claim or a completion write, so the pool can stay well below the
/// scheduler batch size.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::POOL_MAX_CONNECTIONS,
            min_connections: defaults::POOL_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(defaults::POOL_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// | Variable | Default |
    /// |---|---|
    /// | `DATABASE_MAX_CONNECTIONS` | 10 |
    /// | `DATABASE_MIN_CONNECTIONS` | 1 |
    /// | `DATABASE_ACQUIRE_TIMEOUT_SECS` | 30 |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            max_connections: env_u64("DATABASE_MAX_CONNECTIONS")
                .map(|n| n as u32)
                .unwrap_or(base.max_connections),
            min_connections: env_u64("DATABASE_MIN_CONNECTIONS")
                .map(|n| n as u32)
                .unwrap_or(base.min_connections),
            acquire_timeout: env_u64("DATABASE_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.acquire_timeout),
            ..base
        }
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config(
                "DATABASE_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "DATABASE_MIN_CONNECTIONS ({}) exceeds DATABASE_MAX_CONNECTIONS ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Connect with [`PoolConfig::default`].
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    config.validate()?;
    let start = Instant::now();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "State store connected"
    );
    Ok(pool)
}
