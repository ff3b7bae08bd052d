//! AMQP broker implementation.
//!
//! This module connects to RabbitMQ (or any AMQP 0.9.1 broker) using lapin.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::traits::{Broker, BrokerConnection, BrokerError, Delivery, Subscription};

/// AMQP connection settings.
#[derive(Clone)]
pub struct AmqpConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Virtual host.
    pub vhost: String,
    /// Heartbeat interval in seconds.
    pub heartbeat_secs: u16,
}

impl fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .finish()
    }
}

impl AmqpConfig {
    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// AMQP broker.
pub struct AmqpBroker {
    config: AmqpConfig,
}

impl AmqpBroker {
    /// Create a new AMQP broker client.
    #[must_use]
    pub fn new(config: AmqpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        debug!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            "Connecting to AMQP broker"
        );

        let uri = self.config.uri();
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        connection.on_error(move |e| {
            error!(error = %e, "AMQP connection error");
            let _ = errors_tx.send(e.to_string());
        });

        info!(host = %self.config.host, port = self.config.port, "Connected to AMQP broker");

        Ok(Arc::new(AmqpConnection {
            connection,
            errors: Mutex::new(errors_rx),
        }))
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

/// An open AMQP connection.
pub struct AmqpConnection {
    connection: Connection,
    errors: Mutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::QueueDeclare {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let consumer = channel
            .basic_consume(
                queue,
                &format!("trailcast-{queue}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        debug!(queue = %queue, "AMQP consumer started");

        Ok(Box::new(AmqpSubscription {
            queue: queue.to_string(),
            channel,
            consumer,
        }))
    }

    async fn closed(&self) -> BrokerError {
        let mut errors = self.errors.lock().await;
        match errors.recv().await {
            Some(reason) => BrokerError::ConnectionLost(reason),
            None => BrokerError::ConnectionLost("error handler dropped".into()),
        }
    }
}

/// A consumer on one AMQP queue.
pub struct AmqpSubscription {
    queue: String,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|d| Delivery {
                    tag: d.delivery_tag,
                    payload: Bytes::from(d.data),
                })
                .map_err(|e| BrokerError::Consume(e.to_string())),
        )
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AmqpConfig {
        AmqpConfig {
            host: "rabbitmq.local".into(),
            port: 5672,
            username: "relay".into(),
            password: "s3cret".into(),
            vhost: "/".into(),
            heartbeat_secs: 60,
        }
    }

    #[test]
    fn test_uri_from_config() {
        let uri = config().uri();
        assert_eq!(uri.authority.host, "rabbitmq.local");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "relay");
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(60));
    }

    #[test]
    fn test_debug_hides_password() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("s3cret"));
    }
}
