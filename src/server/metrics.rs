//! Server metrics collection.
//!
//! Counters are aggregates. The last observed request surface (TLS
//! fingerprint, Host, User-Agent, HTTP version) is kept so tests and
//! operators can see what agents actually look like on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::transport::Ja3;

/// What the last request looked like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedRequest {
    /// Host header, or the URI authority when there is none
    pub host: Option<String>,
    /// User-Agent header
    pub user_agent: Option<String>,
    /// HTTP version, e.g. `HTTP/2.0`
    pub version: String,
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
}

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// HTTP requests served
    requests: AtomicU64,
    /// Completed OPAQUE registrations
    registrations: AtomicU64,
    /// Completed OPAQUE logins
    authenticated: AtomicU64,
    /// Registrations or logins refused
    auth_rejections: AtomicU64,
    /// Sealed messages without a session key
    unauthenticated: AtomicU64,
    /// Sealed messages that failed to open
    crypto_failures: AtomicU64,
    /// Check-ins processed
    check_ins: AtomicU64,
    /// Total bytes sent
    bytes_sent: AtomicU64,
    /// Total bytes received
    bytes_received: AtomicU64,
    /// TLS handshake failures
    handshake_errors: AtomicU64,
    /// Fingerprint of the last TLS ClientHello
    last_ja3: Mutex<Option<Ja3>>,
    /// Surface of the last HTTP request
    last_request: Mutex<Option<ObservedRequest>>,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            authenticated: AtomicU64::new(0),
            auth_rejections: AtomicU64::new(0),
            unauthenticated: AtomicU64::new(0),
            crypto_failures: AtomicU64::new(0),
            check_ins: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            last_ja3: Mutex::new(None),
            last_request: Mutex::new(None),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record one HTTP request and its surface.
    pub fn record_request(&self, observed: ObservedRequest) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        *self.last_request.lock() = Some(observed);
    }

    /// Record the fingerprint of a TLS ClientHello.
    pub fn record_ja3(&self, ja3: Ja3) {
        *self.last_ja3.lock() = Some(ja3);
    }

    pub(crate) fn increment_registrations(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_authenticated(&self) {
        self.authenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_auth_rejections(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_unauthenticated(&self) {
        self.unauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_crypto_failures(&self) {
        self.crypto_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_check_ins(&self) {
        self.check_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_handshake_errors(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get registrations or logins refused.
    pub fn auth_rejections(&self) -> u64 {
        self.auth_rejections.load(Ordering::Relaxed)
    }

    /// Get completed logins.
    pub fn authenticated(&self) -> u64 {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Get check-ins processed.
    pub fn check_ins(&self) -> u64 {
        self.check_ins.load(Ordering::Relaxed)
    }

    /// Fingerprint of the last TLS ClientHello.
    pub fn last_ja3(&self) -> Option<Ja3> {
        self.last_ja3.lock().clone()
    }

    /// Surface of the last HTTP request.
    pub fn last_request(&self) -> Option<ObservedRequest> {
        self.last_request.lock().clone()
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            authenticated: self.authenticated(),
            auth_rejections: self.auth_rejections(),
            unauthenticated: self.unauthenticated.load(Ordering::Relaxed),
            crypto_failures: self.crypto_failures.load(Ordering::Relaxed),
            check_ins: self.check_ins(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"agentlink server metrics
========================
Uptime: {} seconds

Connections:
  Total:  {}
  Active: {}
  HTTP requests: {}

Agents:
  Registrations:   {}
  Authenticated:   {}
  Auth rejections: {}
  Unauthenticated: {}
  Check-ins:       {}

Traffic:
  Sent:     {} bytes
  Received: {} bytes

Errors:
  Crypto failures:  {}
  Handshake errors: {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.requests,
            snapshot.registrations,
            snapshot.authenticated,
            snapshot.auth_rejections,
            snapshot.unauthenticated,
            snapshot.check_ins,
            snapshot.bytes_sent,
            snapshot.bytes_received,
            snapshot.crypto_failures,
            snapshot.handshake_errors,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all counters at a point in time.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub requests: u64,
    pub registrations: u64,
    pub authenticated: u64,
    pub auth_rejections: u64,
    pub unauthenticated: u64,
    pub crypto_failures: u64,
    pub check_ins: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub handshake_errors: u64,
}

impl MetricsSnapshot {
    /// Share of authentication attempts that were refused.
    pub fn rejection_rate(&self) -> f64 {
        let attempts = self.authenticated + self.auth_rejections;
        if attempts == 0 {
            0.0
        } else {
            self.auth_rejections as f64 / attempts as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counting() {
        let metrics = ServerMetrics::new();

        metrics.increment_connections();
        metrics.increment_connections();
        metrics.decrement_connections();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn test_observed_surface() {
        let metrics = ServerMetrics::new();
        assert!(metrics.last_request().is_none());
        assert!(metrics.last_ja3().is_none());

        metrics.record_request(ObservedRequest {
            host: Some("fake.cloudfront.net".into()),
            user_agent: Some("curl/8.0".into()),
            version: "HTTP/1.1".into(),
            method: "POST".into(),
            path: "/".into(),
        });
        let ja3: Ja3 = "771,4865-4866,0-10,29-23,0".parse().unwrap();
        metrics.record_ja3(ja3.clone());

        let seen = metrics.last_request().unwrap();
        assert_eq!(seen.host.as_deref(), Some("fake.cloudfront.net"));
        assert_eq!(metrics.last_ja3(), Some(ja3));
        assert_eq!(metrics.snapshot().requests, 1);
    }

    #[test]
    fn test_rejection_rate() {
        let metrics = ServerMetrics::new();
        assert_eq!(metrics.snapshot().rejection_rate(), 0.0);

        metrics.increment_authenticated();
        metrics.increment_auth_rejections();
        metrics.increment_auth_rejections();
        metrics.increment_auth_rejections();
        assert!((metrics.snapshot().rejection_rate() - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_format_report() {
        let metrics = ServerMetrics::new();
        metrics.increment_connections();
        metrics.add_bytes_sent(100);

        let report = metrics.format_report();
        assert!(report.contains("agentlink server metrics"));
        assert!(report.contains("Total:  1"));
        assert!(report.contains("Sent:     100 bytes"));
    }
}
