//! Thread-safe session metrics
//!
//! Atomic counters owned by one session manager. Each manager has its own
//! collector so independent sessions (and parallel tests) never share counts.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Counters for one session
#[derive(Debug, Default)]
pub struct SessionMetrics {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    stale_detections: AtomicU64,
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    listener_failures: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    subscription_failures: AtomicU64,
    /// Unix millis of the last successful connect, 0 when never connected
    last_connected_at_ms: AtomicI64,
}

/// Point-in-time copy of [`SessionMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub stale_detections: u64,
    pub messages_received: u64,
    pub decode_failures: u64,
    pub listener_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub subscription_failures: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.last_connected_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Connection dropped, went stale or was declared suspect
    pub fn connection_lost(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Orderly disconnect; not counted as a loss
    pub fn connection_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn stale_detected(&self) {
        self.stale_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_failed(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_failed(&self) {
        self.subscription_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_ms = self.last_connected_at_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
            stale_detections: self.stale_detections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            subscription_failures: self.subscription_failures.load(Ordering::Relaxed),
            last_connected_at: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collector_is_zeroed() {
        let snapshot = SessionMetrics::new().snapshot();

        assert!(!snapshot.connected);
        assert_eq!(snapshot.connection_attempts, 0);
        assert_eq!(snapshot.messages_received, 0);
        assert!(snapshot.last_connected_at.is_none());
    }

    #[test]
    fn test_connection_lifecycle_counters() {
        let metrics = SessionMetrics::new();

        metrics.connection_attempt();
        metrics.connection_failed();
        metrics.connection_attempt();
        metrics.connection_established();

        let snapshot = metrics.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.connection_attempts, 2);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.connections_established, 1);
        assert!(snapshot.last_connected_at.is_some());
    }

    #[test]
    fn test_loss_counted_once_per_connection() {
        let metrics = SessionMetrics::new();
        metrics.connection_established();

        metrics.connection_lost();
        metrics.connection_lost();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_lost, 1);
        assert!(!snapshot.connected);
    }

    #[test]
    fn test_orderly_close_is_not_a_loss() {
        let metrics = SessionMetrics::new();
        metrics.connection_established();

        metrics.connection_closed();

        assert_eq!(metrics.snapshot().connections_lost, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = SessionMetrics::new();
        metrics.message_received();
        metrics.decode_failed();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();

        assert_eq!(json["messages_received"], 1);
        assert_eq!(json["decode_failures"], 1);
        assert!(json["last_connected_at"].is_null());
    }
}
