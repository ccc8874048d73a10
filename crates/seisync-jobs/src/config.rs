//! Scheduler configuration.

use std::time::Duration;

use seisync_core::{defaults, Error, Result};

/// Configuration shared by the batch scheduler and the pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum items processed concurrently.
    pub batch_size: usize,
    /// Per-item attempt cap across runs (stage `retry_count`, document
    /// `attempts`).
    pub max_retries: i32,
    /// Age after which an `in_progress` claim may be taken over.
    pub claim_lease: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            max_retries: defaults::MAX_ITEM_RETRIES,
            claim_lease: Duration::from_secs(defaults::CLAIM_LEASE_SECS),
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SYNC_BATCH_SIZE` | `10` | Concurrent items per run |
    /// | `SYNC_MAX_RETRIES` | `3` | Failed attempts before an item is `error` |
    /// | `SYNC_CLAIM_LEASE_SECS` | `0` | Claim age before takeover |
    pub fn from_env() -> Self {
        let batch_size = std::env::var("SYNC_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::BATCH_SIZE)
            .max(1);

        let max_retries = std::env::var("SYNC_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::MAX_ITEM_RETRIES);

        let claim_lease = std::env::var("SYNC_CLAIM_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(defaults::CLAIM_LEASE_SECS));

        Self {
            batch_size,
            max_retries,
            claim_lease,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("SYNC_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.max_retries < 1 {
            return Err(Error::Config("SYNC_MAX_RETRIES must be at least 1".to_string()));
        }
        Ok(())
    }
}
