//! Transport counters.
//!
//! Shared by every call of a transport and read only for reporting; no
//! control flow depends on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::error::ErrorKind;

/// Lock-free request counters of one transport.
#[derive(Debug, Default)]
pub struct TransportStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    reauthentications: AtomicU64,
    timeouts: AtomicU64,
    server_errors: AtomicU64,
    network_errors: AtomicU64,
    not_found: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    total_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub reauthentications: u64,
    pub timeouts: u64,
    pub server_errors: u64,
    pub network_errors: u64,
    pub not_found: u64,
    pub peak_in_flight: u64,
    pub avg_latency_ms: u64,
    pub max_latency_ms: u64,
}

/// Marks one HTTP exchange in flight until dropped.
pub struct InFlightGuard<'a> {
    stats: &'a TransportStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request going out and track the in-flight peak.
    pub fn begin(&self) -> InFlightGuard<'_> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { stats: self }
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.total_latency_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a call that surfaced an error to its caller.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failed exchange by kind.
    pub fn record_error(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::Timeout => &self.timeouts,
            ErrorKind::ServerError => &self.server_errors,
            ErrorKind::NetworkError => &self.network_errors,
            ErrorKind::NotFound => &self.not_found,
            ErrorKind::RateLimited => &self.rate_limited,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reauthentication(&self) {
        self.reauthentications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            requests,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            reauthentications: self.reauthentications.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            avg_latency_ms: if requests > 0 { total_latency / requests } else { 0 },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
        }
    }
}
