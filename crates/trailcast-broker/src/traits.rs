//! Broker abstraction traits for Trailcast.
//!
//! These traits define the small slice of a message broker the relay needs:
//! open a connection, subscribe to a named queue, pull deliveries one at a
//! time and acknowledge them. Everything else about the broker stays behind
//! the implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not open a connection.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The connection was lost after it was established.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Declaring the queue failed.
    #[error("Queue declare failed for {queue}: {reason}")]
    QueueDeclare {
        /// Queue name.
        queue: String,
        /// Broker-supplied reason.
        reason: String,
    },

    /// Starting or reading from a consumer failed.
    #[error("Consume failed: {0}")]
    Consume(String),

    /// Acknowledging a delivery failed.
    #[error("Ack failed: {0}")]
    Ack(String),
}

/// A single message pulled from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker delivery tag, passed back on ack.
    pub tag: u64,
    /// Message body.
    pub payload: Bytes,
}

/// A message broker the relay can connect to.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;

    /// Get the broker name (e.g., "amqp", "memory").
    fn name(&self) -> &'static str;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Declare a non-durable queue and start consuming from it.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Wait until the connection is lost.
    ///
    /// Resolves with the error that ended the connection. Must be safe to
    /// cancel and call again.
    async fn closed(&self) -> BrokerError;
}

/// A consumer bound to one queue.
#[async_trait]
pub trait Subscription: Send {
    /// The queue being consumed.
    fn queue(&self) -> &str;

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the subscription has been cancelled or its
    /// connection closed.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Acknowledge a delivery.
    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError>;
}
