//! Registry of live viewer connections.
//!
//! Viewers subscribe to a trail and either a single athlete or every athlete
//! on that trail. The registry maps trail -> athlete filter -> connections.
//!
//! A viewer moved to another filter on the same trail is moved under that
//! trail's shard lock, so a lookup on the trail sees it exactly once. A move
//! across trails inserts before it removes. Registering and unregistering the
//! same connection from two tasks at once is not supported.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Athlete filter that matches every athlete on a trail.
pub const ALL_ATHLETES: &str = "all";

/// Unique identifier for a viewer connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Delivery errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The viewer's socket task has gone away.
    #[error("Viewer {0} is closed")]
    Closed(ConnectionId),

    /// The viewer is not keeping up.
    #[error("Viewer {0} buffer is full")]
    Full(ConnectionId),
}

/// The (trail, athlete filter) a viewer subscribed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Trail name.
    pub trail: String,
    /// Athlete id, or [`ALL_ATHLETES`].
    pub athlete: String,
}

impl SubscriptionKey {
    /// Create a new key.
    #[must_use]
    pub fn new(trail: impl Into<String>, athlete: impl Into<String>) -> Self {
        Self {
            trail: trail.into(),
            athlete: athlete.into(),
        }
    }

    /// Key matching every athlete on a trail.
    #[must_use]
    pub fn all(trail: impl Into<String>) -> Self {
        Self::new(trail, ALL_ATHLETES)
    }

    /// Whether this key is the trail-wide wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.athlete == ALL_ATHLETES
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trail, self.athlete)
    }
}

/// Sending side of a viewer connection.
///
/// The socket task keeps the matching receiver and writes whatever arrives
/// on it to the client.
#[derive(Debug, Clone)]
pub struct Viewer {
    id: ConnectionId,
    sender: mpsc::Sender<Bytes>,
}

impl Viewer {
    /// Create a viewer handle and the receiver its socket task drains.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let viewer = Self {
            id: next_connection_id(),
            sender,
        };
        (viewer, receiver)
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Hand a payload to the viewer without waiting.
    ///
    /// # Errors
    ///
    /// Fails if the viewer is closed or its buffer is full.
    pub fn deliver(&self, payload: Bytes) -> Result<(), DeliveryError> {
        self.sender.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.id),
        })
    }

    /// Whether the socket task is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

type Bucket = HashMap<ConnectionId, Viewer>;

/// Registry of viewer connections.
#[derive(Debug, Default)]
pub struct Registry {
    /// trail -> athlete filter -> connections.
    trails: DashMap<String, HashMap<String, Bucket>>,
    /// connection -> where it is registered.
    index: DashMap<ConnectionId, SubscriptionKey>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a viewer under a key.
    ///
    /// A viewer that is already registered is moved to the new key.
    pub fn register(&self, viewer: Viewer, key: SubscriptionKey) {
        let id = viewer.id();
        let previous = self.index.insert(id, key.clone());

        {
            let mut athletes = self.trails.entry(key.trail.clone()).or_default();
            if let Some(prev) = previous.as_ref().filter(|p| p.trail == key.trail) {
                remove_from_athletes(&mut athletes, id, &prev.athlete);
            }
            athletes
                .entry(key.athlete.clone())
                .or_default()
                .insert(id, viewer);
        }

        // Shard guard above is released before touching another trail
        if let Some(prev) = previous.filter(|p| p.trail != key.trail) {
            self.remove_from_bucket(id, &prev);
        }

        debug!(connection = id, subscription = %key, "Viewer registered");
    }

    /// Remove a viewer from whichever bucket holds it.
    ///
    /// Returns `true` if the viewer was registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        match self.index.remove(&id) {
            Some((_, key)) => {
                self.remove_from_bucket(id, &key);
                debug!(connection = id, subscription = %key, "Viewer unregistered");
                true
            }
            None => false,
        }
    }

    fn remove_from_bucket(&self, id: ConnectionId, key: &SubscriptionKey) {
        let mut trail_empty = false;
        if let Some(mut athletes) = self.trails.get_mut(&key.trail) {
            remove_from_athletes(&mut athletes, id, &key.athlete);
            trail_empty = athletes.is_empty();
        }
        if trail_empty {
            self.trails
                .remove_if(&key.trail, |_, athletes| athletes.is_empty());
        }
    }

    /// Viewers that should receive a message for (trail, athlete).
    ///
    /// This is the union of the trail's wildcard bucket and the bucket for
    /// that athlete. Either may be empty.
    #[must_use]
    pub fn lookup(&self, trail: &str, athlete: &str) -> Vec<Viewer> {
        let Some(athletes) = self.trails.get(trail) else {
            return Vec::new();
        };

        let wildcard = athletes
            .get(ALL_ATHLETES)
            .into_iter()
            .flat_map(|b| b.values());
        // A message whose athlete is literally "all" must not hit the wildcard bucket twice
        let specific = (athlete != ALL_ATHLETES)
            .then(|| athletes.get(athlete))
            .flatten()
            .into_iter()
            .flat_map(|b| b.values());

        let targets: Vec<Viewer> = wildcard.chain(specific).cloned().collect();
        trace!(trail = %trail, athlete = %athlete, targets = targets.len(), "Lookup");
        targets
    }

    /// The key a viewer is registered under.
    #[must_use]
    pub fn subscription(&self, id: ConnectionId) -> Option<SubscriptionKey> {
        self.index.get(&id).map(|k| k.value().clone())
    }

    /// Number of registered viewers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no viewers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of trails with at least one viewer.
    #[must_use]
    pub fn trail_count(&self) -> usize {
        self.trails.len()
    }

    /// Number of viewers on a trail, across all filters.
    #[must_use]
    pub fn subscriber_count(&self, trail: &str) -> usize {
        self.trails
            .get(trail)
            .map(|athletes| athletes.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }
}

fn remove_from_athletes(
    athletes: &mut HashMap<String, Bucket>,
    id: ConnectionId,
    athlete: &str,
) {
    if let Some(bucket) = athletes.get_mut(athlete) {
        bucket.remove(&id);
        if bucket.is_empty() {
            athletes.remove(athlete);
        }
    }
}
