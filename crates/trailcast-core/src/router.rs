//! Message router.
//!
//! The router takes a raw broker payload through one processing cycle:
//! validate it, refresh presence, resolve the viewers subscribed to it and
//! hand each of them the payload verbatim.

use crate::message::{Message, MessageError};
use crate::metrics::{ProcessStatus, RelayMetrics};
use crate::presence::PresenceTracker;
use crate::registry::Registry;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The payload was rejected and dropped.
    #[error("Dropped invalid message: {0}")]
    InvalidMessage(#[from] MessageError),
}

/// Result of fanning out one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Viewers the payload was handed to.
    pub delivered: usize,
    /// Viewers whose delivery failed.
    pub failed: usize,
}

/// Routes broker payloads to viewer connections.
pub struct MessageRouter {
    registry: Arc<Registry>,
    presence: Arc<PresenceTracker>,
    metrics: Arc<dyn RelayMetrics>,
}

impl MessageRouter {
    /// Create a router over shared registry and presence state.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        presence: Arc<PresenceTracker>,
        metrics: Arc<dyn RelayMetrics>,
    ) -> Self {
        info!(ttl_ms = presence.ttl().as_millis() as u64, "Creating message router");
        Self {
            registry,
            presence,
            metrics,
        }
    }

    /// The viewer registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The presence tracker.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// The metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn RelayMetrics> {
        &self.metrics
    }

    /// Run one processing cycle for a raw payload.
    ///
    /// Delivery failures are isolated per viewer and reported in the returned
    /// [`Fanout`]; they never stop delivery to the remaining viewers.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload was invalid. The message has already
    /// been dropped and counted by then; callers only need it for logging.
    pub fn route(&self, payload: impl Into<Bytes>) -> Result<Fanout, RouteError> {
        let start = Instant::now();

        let message = match Message::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping invalid message");
                self.metrics.record_processed(ProcessStatus::Error);
                self.metrics.record_processing_time(start.elapsed());
                return Err(e.into());
            }
        };

        self.update_presence(&message, Instant::now());
        let fanout = self.deliver(&message);

        self.metrics.record_processed(ProcessStatus::Success);
        self.metrics.record_processing_time(start.elapsed());

        trace!(
            trail = %message.trail(),
            athlete = %message.athlete(),
            delivered = fanout.delivered,
            failed = fanout.failed,
            "Routed message"
        );

        Ok(fanout)
    }

    fn update_presence(&self, message: &Message, now: Instant) {
        self.presence.touch(message.trail(), message.athlete(), now);

        let snapshot = self.presence.sweep(now);
        for (trail, count) in &snapshot.by_trail {
            self.metrics.set_active_runners_for_trail(trail, *count);
        }
        self.metrics.set_active_runners(snapshot.total);
    }

    fn deliver(&self, message: &Message) -> Fanout {
        let mut fanout = Fanout::default();

        for viewer in self.registry.lookup(message.trail(), message.athlete()) {
            match viewer.deliver(message.payload().clone()) {
                Ok(()) => fanout.delivered += 1,
                Err(e) => {
                    warn!(
                        trail = %message.trail(),
                        connection = viewer.id(),
                        error = %e,
                        "Delivery failed"
                    );
                    self.metrics.record_delivery_failure();
                    fanout.failed += 1;
                }
            }
        }

        fanout
    }
}
