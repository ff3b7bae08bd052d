//! Per-trail queue consumer.
//!
//! Each configured trail gets one consumer task bound to the queue
//! `<namespace>_<trail>`. The consumer pulls deliveries in order, routes
//! them and acknowledges each one after routing, whether or not the router
//! accepted it. Malformed payloads are therefore never redelivered.

use std::sync::Arc;
use tracing::{debug, info, warn};
use trailcast_core::MessageRouter;

use crate::traits::{BrokerConnection, BrokerError};

/// Queue name for a trail.
#[must_use]
pub fn queue_name(namespace: &str, trail: &str) -> String {
    format!("{namespace}_{trail}")
}

/// Consumes one trail's queue.
pub struct QueueConsumer {
    trail: String,
    queue: String,
    router: Arc<MessageRouter>,
}

impl QueueConsumer {
    /// Create a consumer for a trail.
    #[must_use]
    pub fn new(namespace: &str, trail: impl Into<String>, router: Arc<MessageRouter>) -> Self {
        let trail = trail.into();
        Self {
            queue: queue_name(namespace, &trail),
            trail,
            router,
        }
    }

    /// The trail this consumer serves.
    #[must_use]
    pub fn trail(&self) -> &str {
        &self.trail
    }

    /// The queue this consumer reads.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until the subscription ends.
    ///
    /// Returns the number of messages processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be subscribed to, or if reading
    /// or acknowledging fails.
    pub async fn run(self, connection: Arc<dyn BrokerConnection>) -> Result<u64, BrokerError> {
        let mut subscription = connection.subscribe(&self.queue).await?;
        info!(trail = %self.trail, queue = %self.queue, "Consuming");

        let mut processed = 0;
        while let Some(delivery) = subscription.next().await {
            let delivery = delivery?;

            if let Err(e) = self.router.route(delivery.payload) {
                debug!(queue = %self.queue, error = %e, "Message dropped, acknowledging anyway");
            }

            subscription.ack(delivery.tag).await?;
            processed += 1;
        }

        warn!(trail = %self.trail, queue = %self.queue, processed, "Subscription ended");
        Ok(processed)
    }
}
