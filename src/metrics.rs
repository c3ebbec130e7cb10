//! Metrics collection for the messaging layer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the producer and subscription paths
#[derive(Debug, Default)]
pub struct BusMetrics {
    // Producer side
    pub messages_published: AtomicU64,
    pub publish_retries: AtomicU64,
    pub publish_errors: AtomicU64,

    // Subscription side
    pub messages_dispatched: AtomicU64,
    pub handler_failures: AtomicU64,
    pub dlq_messages: AtomicU64,
    pub commit_failures: AtomicU64,
    pub reconnects: AtomicU64,
}

impl BusMetrics {
    pub fn record_publish(&self, count: u64) {
        self.messages_published.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_message(&self) {
        self.dlq_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters at a point in time
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            dlq_messages: self.dlq_messages.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`BusMetrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub publish_retries: u64,
    pub publish_errors: u64,
    pub messages_dispatched: u64,
    pub handler_failures: u64,
    pub dlq_messages: u64,
    pub commit_failures: u64,
    pub reconnects: u64,
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<BusMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(BusMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<BusMetrics> {
    Arc::clone(&GLOBAL_METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = BusMetrics::default();
        metrics.record_publish(3);
        metrics.record_publish_retry();
        metrics.record_dispatch();
        metrics.record_dispatch();
        metrics.record_dlq_message();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 3);
        assert_eq!(snapshot.publish_retries, 1);
        assert_eq!(snapshot.messages_dispatched, 2);
        assert_eq!(snapshot.dlq_messages, 1);
        assert_eq!(snapshot.commit_failures, 0);
    }

    #[test]
    fn test_global_instance_is_shared() {
        let a = global_metrics();
        let b = global_metrics();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
