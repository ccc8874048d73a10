//! Centralized default constants for seisync.
//!
//! Every crate reads its fallback values from here so the CLI, the
//! pipelines and the tests agree on one set of numbers.

// =============================================================================
// SEI API
// =============================================================================

/// Default base URL of the SEI API.
pub const SEI_BASE_URL: &str = "https://api.sei.pi.gov.br";

/// Per-request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Simultaneous metadata calls (permit pool size).
pub const MAX_CONCURRENT_REQUESTS: usize = 10;

/// Simultaneous document downloads (permit pool size).
pub const MAX_CONCURRENT_DOWNLOADS: usize = 5;

/// Attempts per call for server errors, timeouts and network errors.
pub const MAX_REQUEST_ATTEMPTS: u32 = 3;

/// First exponential backoff delay.
pub const BACKOFF_BASE_MS: u64 = 2_000;

/// Upper bound of a single backoff delay.
pub const BACKOFF_MAX_MS: u64 = 10_000;

/// Fixed sleep after a 429 response.
pub const RATE_LIMIT_COOLDOWN_MS: u64 = 5_000;

/// Assumed token lifetime; the login response carries no expiry.
pub const TOKEN_TTL_SECS: u64 = 3_600;

/// Refresh the token this long before it expires.
pub const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

/// Page size of the document listing endpoint.
pub const DOCUMENTS_PAGE_SIZE: u32 = 15;

/// Page size of the activity history endpoint.
pub const ACTIVITIES_PAGE_SIZE: u32 = 100;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Concurrent workers per scheduler invocation.
pub const BATCH_SIZE: usize = 10;

/// Failed attempts before a sub-status or document is marked `error`.
pub const MAX_ITEM_RETRIES: i32 = 3;

/// Age after which an `in_progress` claim may be taken over. Zero makes
/// leftovers of an interrupted run immediately reclaimable.
pub const CLAIM_LEASE_SECS: u64 = 0;

/// Capacity of the scheduler event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Maximum stored length of `last_error`.
pub const LAST_ERROR_MAX_CHARS: usize = 500;

// =============================================================================
// STORAGE
// =============================================================================

/// Default object storage root for the filesystem backend.
pub const STORAGE_PATH: &str = "./data/documents";

/// Extension used when neither the headers nor the bytes reveal a type.
pub const FALLBACK_EXTENSION: &str = "bin";

// =============================================================================
// DATABASE
// =============================================================================

/// Default connection string.
pub const DATABASE_URL: &str = "postgres://localhost/seisync";

/// Maximum pool connections.
pub const POOL_MAX_CONNECTIONS: u32 = 10;

/// Minimum idle pool connections.
pub const POOL_MIN_CONNECTIONS: u32 = 1;

/// Connection acquire timeout.
pub const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds_are_ordered() {
        assert!(BACKOFF_BASE_MS <= BACKOFF_MAX_MS);
    }

    #[test]
    fn test_refresh_margin_shorter_than_ttl() {
        assert!(TOKEN_REFRESH_MARGIN_SECS < TOKEN_TTL_SECS);
    }

    #[test]
    fn test_download_pool_not_larger_than_request_pool() {
        assert!(MAX_CONCURRENT_DOWNLOADS <= MAX_CONCURRENT_REQUESTS);
    }
}
