//! In-process broker.
//!
//! Queues live for as long as the broker does, so messages published while
//! no connection is open wait for the next subscriber. Connection drops,
//! refused connects and failing queue declarations can be injected, which
//! makes this broker the test double for consumers and the supervisor.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::traits::{Broker, BrokerConnection, BrokerError, Delivery, Subscription};

type QueueReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Bytes>>>;

struct Queue {
    sender: mpsc::UnboundedSender<Bytes>,
    receiver: QueueReceiver,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }
}

struct Inner {
    queues: Mutex<HashMap<String, Queue>>,
    failing_queues: Mutex<HashSet<String>>,
    /// Bumped on every injected drop; connections opened in an older epoch are dead.
    epoch: watch::Sender<u64>,
    refuse_connects: AtomicUsize,
    connects: AtomicUsize,
    acks: AtomicU64,
    next_tag: AtomicU64,
}

/// An in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                failing_queues: Mutex::new(HashSet::new()),
                epoch,
                refuse_connects: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                acks: AtomicU64::new(0),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Queue>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_receiver(&self, queue: &str) -> QueueReceiver {
        self.queues()
            .entry(queue.to_string())
            .or_insert_with(Queue::new)
            .receiver
            .clone()
    }

    /// Put a message on a queue, declaring it if needed.
    pub fn publish(&self, queue: &str, payload: impl Into<Bytes>) {
        let mut queues = self.queues();
        let entry = queues.entry(queue.to_string()).or_insert_with(Queue::new);
        // The receiver lives in the same entry, so the queue cannot be closed
        let _ = entry.sender.send(payload.into());
    }

    /// Kill every open connection.
    pub fn drop_connections(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
        info!("Memory broker: dropped all connections");
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: usize) {
        self.inner.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Make declaring the given queue fail.
    pub fn fail_queue(&self, queue: &str) {
        self.inner
            .failing_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string());
    }

    /// Number of successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of acknowledged deliveries so far.
    #[must_use]
    pub fn ack_count(&self) -> u64 {
        self.inner.acks.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let refused = self
            .inner
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Connect("connection refused".into()));
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let epoch = *self.inner.epoch.borrow();
        debug!(epoch, "Memory broker: connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            epoch,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    epoch: u64,
}

async fn wait_for_drop(mut epochs: watch::Receiver<u64>, epoch: u64) {
    // The sender lives in the broker, which outlives every connection
    let _ = epochs.wait_for(|current| *current != epoch).await;
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let failing = self
            .broker
            .inner
            .failing_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue);
        if failing {
            return Err(BrokerError::QueueDeclare {
                queue: queue.to_string(),
                reason: "declare refused".into(),
            });
        }

        let epochs = self.broker.inner.epoch.subscribe();
        if *epochs.borrow() != self.epoch {
            return Err(BrokerError::ConnectionLost("connection closed".into()));
        }

        // One consumer per queue at a time; a replacement waits for the old one to go away
        let receiver = self.broker.queue_receiver(queue).lock_owned().await;

        Ok(Box::new(MemorySubscription {
            queue: queue.to_string(),
            broker: self.broker.clone(),
            receiver,
            epochs,
            epoch: self.epoch,
        }))
    }

    async fn closed(&self) -> BrokerError {
        wait_for_drop(self.broker.inner.epoch.subscribe(), self.epoch).await;
        BrokerError::ConnectionLost("connection dropped by broker".into())
    }
}

struct MemorySubscription {
    queue: String,
    broker: MemoryBroker,
    receiver: OwnedMutexGuard<mpsc::UnboundedReceiver<Bytes>>,
    epochs: watch::Receiver<u64>,
    epoch: u64,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        tokio::select! {
            biased;

            () = wait_for_drop(self.epochs.clone(), self.epoch) => None,
            payload = self.receiver.recv() => payload.map(|payload| {
                Ok(Delivery {
                    tag: self.broker.inner.next_tag.fetch_add(1, Ordering::SeqCst),
                    payload,
                })
            }),
        }
    }

    async fn ack(&mut self, _tag: u64) -> Result<(), BrokerError> {
        if *self.epochs.borrow() != self.epoch {
            return Err(BrokerError::Ack("connection closed".into()));
        }
        self.broker.inner.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
