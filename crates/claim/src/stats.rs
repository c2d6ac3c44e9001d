//! IPC statistics
//!
//! Counters are plain atomics so both the request path and the response
//! dispatcher can update them without a lock. Rates and averages are derived
//! on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Sentinel for an unset timestamp
const UNSET: i64 = i64::MIN;

/// Running counters for one side of the claim IPC channel
#[derive(Debug)]
pub struct IpcStatistics {
    requests: AtomicU64,
    responses: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    invalid_requests: AtomicU64,
    discarded_responses: AtomicU64,
    accepted_connections: AtomicU64,
    rejected_connections: AtomicU64,
    authenticated_clients: AtomicU64,
    authentication_failures: AtomicU64,
    total_response_micros: AtomicU64,
    started_at_ms: AtomicI64,
    stopped_at_ms: AtomicI64,
}

impl Default for IpcStatistics {
    fn default() -> Self {
        Self {
            requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            invalid_requests: AtomicU64::new(0),
            discarded_responses: AtomicU64::new(0),
            accepted_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            authenticated_clients: AtomicU64::new(0),
            authentication_failures: AtomicU64::new(0),
            total_response_micros: AtomicU64::new(0),
            started_at_ms: AtomicI64::new(UNSET),
            stopped_at_ms: AtomicI64::new(UNSET),
        }
    }
}

impl IpcStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of service, clearing any previous stop time
    pub fn mark_started(&self) {
        self.started_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.stopped_at_ms.store(UNSET, Ordering::Relaxed);
    }

    /// Mark the end of service
    pub fn mark_stopped(&self) {
        self.stopped_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// A request entered the IPC layer
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A request completed with a response
    pub fn record_response(&self, elapsed: Duration, success: bool) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        self.total_response_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A request ended without a response for a reason other than timeout
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A request ended because its timeout elapsed
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An undecodable or malformed message was received
    pub fn record_invalid_request(&self) {
        self.invalid_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A response arrived with no matching pending request
    pub fn record_discarded_response(&self) {
        self.discarded_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_accepted(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authenticated_client(&self) {
        self.authenticated_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authentication_failure(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn invalid_requests(&self) -> u64 {
        self.invalid_requests.load(Ordering::Relaxed)
    }

    pub fn discarded_responses(&self) -> u64 {
        self.discarded_responses.load(Ordering::Relaxed)
    }

    pub fn authentication_failures(&self) -> u64 {
        self.authentication_failures.load(Ordering::Relaxed)
    }

    /// Fraction of finished requests that succeeded (1.0 when none finished)
    pub fn success_rate(&self) -> f64 {
        let successes = self.successes();
        let finished = successes + self.failures();
        if finished == 0 {
            1.0
        } else {
            successes as f64 / finished as f64
        }
    }

    /// Mean time from request to response over all responses
    pub fn average_response_time(&self) -> Duration {
        let responses = self.responses();
        if responses == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_response_micros.load(Ordering::Relaxed) / responses)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        load_timestamp(&self.started_at_ms)
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        load_timestamp(&self.stopped_at_ms)
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            requests: self.requests(),
            responses: self.responses(),
            successes: self.successes(),
            failures: self.failures(),
            timeouts: self.timeouts(),
            invalid_requests: self.invalid_requests(),
            discarded_responses: self.discarded_responses(),
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            authenticated_clients: self.authenticated_clients.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures(),
            success_rate: self.success_rate(),
            average_response_micros: self.average_response_time().as_micros() as u64,
            started_at: self.started_at(),
            stopped_at: self.stopped_at(),
        }
    }
}

fn load_timestamp(cell: &AtomicI64) -> Option<DateTime<Utc>> {
    match cell.load(Ordering::Relaxed) {
        UNSET => None,
        ms => DateTime::from_timestamp_millis(ms),
    }
}

/// Serializable copy of [`IpcStatistics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub invalid_requests: u64,
    pub discarded_responses: u64,
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub authenticated_clients: u64,
    pub authentication_failures: u64,
    pub success_rate: f64,
    pub average_response_micros: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}
