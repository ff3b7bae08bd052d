//! Broker connection supervisor.
//!
//! The supervisor owns the broker link. It connects, starts one queue
//! consumer per trail, and waits for the link to drop. On any failure it
//! tears every consumer down, waits a fixed delay and starts over. It never
//! gives up.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use trailcast_core::MessageRouter;

use crate::consumer::QueueConsumer;
use crate::traits::{Broker, BrokerConnection};

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Broker link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected; a retry is pending.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected and consuming.
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Queue name prefix.
    pub namespace: String,
    /// Trails to consume.
    pub trails: Vec<String>,
    /// Delay before reconnecting.
    pub retry_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            namespace: "group6".to_string(),
            trails: vec!["default".to_string()],
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Keeps the broker link and its consumers alive.
pub struct Supervisor {
    broker: Arc<dyn Broker>,
    router: Arc<MessageRouter>,
    config: SupervisorConfig,
    state: watch::Sender<LinkState>,
}

impl Supervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        router: Arc<MessageRouter>,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            broker,
            router,
            config,
            state,
        }
    }

    /// Watch link state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LinkState) {
        self.state.send_replace(next);
        debug!(broker = self.broker.name(), state = %next, "Broker link state");
    }

    /// Run forever.
    pub async fn run(self) {
        info!(
            broker = self.broker.name(),
            namespace = %self.config.namespace,
            trails = ?self.config.trails,
            "Starting broker supervisor"
        );

        let mut attempt: u64 = 0;
        loop {
            if attempt > 0 {
                self.router.metrics().record_broker_reconnect();
            }
            attempt += 1;

            self.transition(LinkState::Connecting);
            match self.broker.connect().await {
                Ok(connection) => {
                    self.transition(LinkState::Connected);
                    self.serve(connection).await;
                }
                Err(e) => error!(attempt, error = %e, "Broker connection failed"),
            }

            self.transition(LinkState::Disconnected);
            warn!(
                delay_ms = self.config.retry_delay.as_millis() as u64,
                "Reconnecting to broker"
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Consume on one connection until it is lost.
    async fn serve(&self, connection: Arc<dyn BrokerConnection>) {
        let mut consumers = JoinSet::new();
        for trail in &self.config.trails {
            let consumer =
                QueueConsumer::new(&self.config.namespace, trail.clone(), self.router.clone());
            consumers.spawn(consumer.run(connection.clone()));
        }

        loop {
            tokio::select! {
                e = connection.closed() => {
                    warn!(error = %e, "Broker connection lost");
                    break;
                }
                Some(result) = consumers.join_next() => match result {
                    Ok(Ok(processed)) => debug!(processed, "Consumer finished"),
                    Ok(Err(e)) => error!(error = %e, "Consumer failed"),
                    Err(e) => error!(error = %e, "Consumer task panicked"),
                },
            }
        }

        // Every reconnect starts from a fresh set of consumers
        consumers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use bytes::Bytes;
    use trailcast_core::{InMemoryMetrics, PresenceTracker, Registry, SubscriptionKey, Viewer};

    fn position(trail: &str) -> String {
        format!(
            r#"{{"trail":"{trail}","athlete":"runner42","location":{{"latitude":32.7,"longitude":-17.0}},"gender":"female"}}"#
        )
    }

    fn setup(
        trails: &[&str],
    ) -> (
        Supervisor,
        MemoryBroker,
        Arc<MessageRouter>,
        Arc<InMemoryMetrics>,
    ) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = Arc::new(MessageRouter::new(
            Arc::new(Registry::new()),
            Arc::new(PresenceTracker::default()),
            metrics.clone(),
        ));
        let broker = MemoryBroker::new();
        let config = SupervisorConfig {
            namespace: "group6".into(),
            trails: trails.iter().map(|t| t.to_string()).collect(),
            retry_delay: Duration::from_millis(20),
        };
        let supervisor = Supervisor::new(Arc::new(broker.clone()), router.clone(), config);
        (supervisor, broker, router, metrics)
    }

    async fn wait_for(state: &mut watch::Receiver<LinkState>, target: LinkState) {
        state.wait_for(|s| *s == target).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_drop() {
        let (supervisor, broker, router, metrics) = setup(&["pr9"]);
        let (viewer, mut rx) = Viewer::channel(8);
        router
            .registry()
            .register(viewer, SubscriptionKey::all("pr9"));

        let mut state = supervisor.state();
        let handle = tokio::spawn(supervisor.run());
        wait_for(&mut state, LinkState::Connected).await;

        broker.publish("group6_pr9", position("pr9"));
        assert!(rx.recv().await.is_some());

        broker.drop_connections();
        wait_for(&mut state, LinkState::Disconnected).await;
        wait_for(&mut state, LinkState::Connected).await;

        assert_eq!(broker.connect_count(), 2);
        assert_eq!(metrics.broker_reconnects(), 1);

        let payload = position("pr9");
        broker.publish("group6_pr9", payload.clone());
        assert_eq!(rx.recv().await.unwrap(), Bytes::from(payload));

        handle.abort();
    }

    #[tokio::test]
    async fn test_retries_refused_connects() {
        let (supervisor, broker, _router, metrics) = setup(&["pr9"]);
        broker.refuse_connects(3);

        let mut state = supervisor.state();
        let handle = tokio::spawn(supervisor.run());
        wait_for(&mut state, LinkState::Connected).await;

        assert_eq!(broker.connect_count(), 1);
        assert_eq!(metrics.broker_reconnects(), 3);

        handle.abort();
    }

    #[tokio::test]
    async fn test_failed_trail_does_not_affect_others() {
        let (supervisor, broker, router, _metrics) = setup(&["pr9", "pr21"]);
        broker.fail_queue("group6_pr9");
        let (viewer, mut rx) = Viewer::channel(8);
        router
            .registry()
            .register(viewer, SubscriptionKey::all("pr21"));

        let mut state = supervisor.state();
        let handle = tokio::spawn(supervisor.run());
        wait_for(&mut state, LinkState::Connected).await;

        broker.publish("group6_pr21", position("pr21"));
        assert!(rx.recv().await.is_some());
        assert_eq!(*state.borrow(), LinkState::Connected);
        assert_eq!(broker.connect_count(), 1);

        handle.abort();
    }
}
