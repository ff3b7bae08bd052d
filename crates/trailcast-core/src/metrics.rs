//! Metrics interface for the relay.
//!
//! The core only reports events; aggregation and exposition belong to
//! whoever implements [`RelayMetrics`]. The server wires this to the
//! `metrics` facade and a Prometheus exporter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Outcome of one message processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    /// Message was valid and routed.
    Success,
    /// Message was dropped.
    Error,
}

impl ProcessStatus {
    /// Label value used when exporting.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Sink for relay metrics.
pub trait RelayMetrics: Send + Sync {
    /// Count a processed message.
    fn record_processed(&self, status: ProcessStatus);

    /// Record how long one processing cycle took.
    fn record_processing_time(&self, elapsed: Duration);

    /// Set the number of active runners across all trails.
    fn set_active_runners(&self, count: usize);

    /// Set the number of active runners on one trail.
    fn set_active_runners_for_trail(&self, trail: &str, count: usize);

    /// Count a delivery that could not be handed to a viewer.
    fn record_delivery_failure(&self) {}

    /// Count a broker reconnect attempt.
    fn record_broker_reconnect(&self) {}
}

/// Metrics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RelayMetrics for NoopMetrics {
    fn record_processed(&self, _status: ProcessStatus) {}
    fn record_processing_time(&self, _elapsed: Duration) {}
    fn set_active_runners(&self, _count: usize) {}
    fn set_active_runners_for_trail(&self, _trail: &str, _count: usize) {}
}

/// Metrics sink that keeps the latest values in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    success: AtomicU64,
    errors: AtomicU64,
    timings: AtomicU64,
    delivery_failures: AtomicU64,
    reconnects: AtomicU64,
    active_runners: AtomicU64,
    by_trail: Mutex<HashMap<String, usize>>,
}

impl InMemoryMetrics {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages counted with the given status.
    #[must_use]
    pub fn processed(&self, status: ProcessStatus) -> u64 {
        match status {
            ProcessStatus::Success => self.success.load(Ordering::Relaxed),
            ProcessStatus::Error => self.errors.load(Ordering::Relaxed),
        }
    }

    /// Number of processing durations recorded.
    #[must_use]
    pub fn timings_recorded(&self) -> u64 {
        self.timings.load(Ordering::Relaxed)
    }

    /// Number of failed deliveries.
    #[must_use]
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Number of broker reconnects.
    #[must_use]
    pub fn broker_reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Last reported global active runner count.
    #[must_use]
    pub fn active_runners(&self) -> usize {
        self.active_runners.load(Ordering::Relaxed) as usize
    }

    /// Last reported active runner count for a trail, if ever reported.
    #[must_use]
    pub fn active_runners_for_trail(&self, trail: &str) -> Option<usize> {
        self.by_trail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(trail)
            .copied()
    }
}

impl RelayMetrics for InMemoryMetrics {
    fn record_processed(&self, status: ProcessStatus) {
        match status {
            ProcessStatus::Success => self.success.fetch_add(1, Ordering::Relaxed),
            ProcessStatus::Error => self.errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_processing_time(&self, _elapsed: Duration) {
        self.timings.fetch_add(1, Ordering::Relaxed);
    }

    fn set_active_runners(&self, count: usize) {
        self.active_runners.store(count as u64, Ordering::Relaxed);
    }

    fn set_active_runners_for_trail(&self, trail: &str, count: usize) {
        self.by_trail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(trail.to_string(), count);
    }

    fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_broker_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}
