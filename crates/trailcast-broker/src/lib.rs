//! # trailcast-broker
//!
//! Broker side of the Trailcast relay.
//!
//! This crate consumes position updates from a message broker and feeds them
//! to the [`trailcast_core::MessageRouter`]:
//!
//! - **Traits** - The minimal broker interface the relay relies on
//! - **AMQP** - RabbitMQ implementation on top of lapin
//! - **Memory** - In-process broker for tests and local runs
//! - **Consumer** - One task per trail, ack after routing
//! - **Supervisor** - Reconnects forever and restarts all consumers
//!
//! ```rust,ignore
//! use trailcast_broker::{AmqpBroker, Supervisor, SupervisorConfig};
//!
//! let supervisor = Supervisor::new(Arc::new(AmqpBroker::new(amqp)), router, config);
//! tokio::spawn(supervisor.run());
//! ```

pub mod consumer;
pub mod memory;
pub mod supervisor;
pub mod traits;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use consumer::{queue_name, QueueConsumer};
pub use memory::MemoryBroker;
pub use supervisor::{LinkState, Supervisor, SupervisorConfig, DEFAULT_RETRY_DELAY};
pub use traits::{Broker, BrokerConnection, BrokerError, Delivery, Subscription};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
