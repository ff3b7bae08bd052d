//! Runner presence tracking.
//!
//! A runner is active on a trail while position updates keep arriving for it.
//! Each valid message refreshes the runner's last-seen time, and entries older
//! than the TTL are dropped on the next sweep.
//!
//! Sweeps are driven by message arrival rather than a timer: the router sweeps
//! once per processed message. Gauges therefore lag by at most the gap between
//! two valid messages, and they do not decay at all while no messages arrive.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default presence TTL (three minutes).
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_millis(180_000);

/// Active runner counts produced by a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    /// Active runners across all trails.
    pub total: usize,
    /// Active runners per trail, including trails that dropped to zero.
    pub by_trail: BTreeMap<String, usize>,
}

/// Tracks the last time each (trail, athlete) pair was seen.
#[derive(Debug)]
pub struct PresenceTracker {
    ttl: Duration,
    /// trail -> athlete -> last seen.
    trails: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl PresenceTracker {
    /// Create a tracker with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            trails: Mutex::new(HashMap::new()),
        }
    }

    /// The configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Instant>>> {
        self.trails.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that a runner was seen at `now`.
    pub fn touch(&self, trail: &str, athlete: &str, now: Instant) {
        let mut trails = self.lock();
        let athletes = trails.entry(trail.to_string()).or_default();
        if athletes.insert(athlete.to_string(), now).is_none() {
            debug!(trail = %trail, athlete = %athlete, "Presence: runner active");
        }
    }

    /// Drop runners not seen for longer than the TTL and recount.
    pub fn sweep(&self, now: Instant) -> PresenceSnapshot {
        let ttl = self.ttl;
        let mut trails = self.lock();
        let mut snapshot = PresenceSnapshot::default();

        for (trail, athletes) in trails.iter_mut() {
            athletes.retain(|athlete, last_seen| {
                let alive = now.saturating_duration_since(*last_seen) <= ttl;
                if !alive {
                    debug!(trail = %trail, athlete = %athlete, "Presence: runner expired");
                }
                alive
            });
            snapshot.total += athletes.len();
            snapshot.by_trail.insert(trail.clone(), athletes.len());
        }

        snapshot
    }

    /// Check whether a runner is currently tracked.
    #[must_use]
    pub fn is_active(&self, trail: &str, athlete: &str) -> bool {
        self.lock()
            .get(trail)
            .is_some_and(|athletes| athletes.contains_key(athlete))
    }

    /// Number of tracked runners on a trail.
    #[must_use]
    pub fn active_count(&self, trail: &str) -> usize {
        self.lock().get(trail).map_or(0, HashMap::len)
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_and_sweep() {
        let presence = PresenceTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();

        presence.touch("pr9", "runner42", t0);
        presence.touch("pr9", "runner7", t0);
        presence.touch("pr21", "runner1", t0);

        let snapshot = presence.sweep(t0);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.by_trail["pr9"], 2);
        assert_eq!(snapshot.by_trail["pr21"], 1);
    }

    #[test]
    fn test_touch_refreshes() {
        let presence = PresenceTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();

        presence.touch("pr9", "runner42", t0);
        presence.touch("pr9", "runner42", t0 + Duration::from_secs(8));

        let snapshot = presence.sweep(t0 + Duration::from_secs(15));
        assert_eq!(snapshot.total, 1);
        assert!(presence.is_active("pr9", "runner42"));
    }

    #[test]
    fn test_expiry_is_strict() {
        let presence = PresenceTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        presence.touch("pr9", "runner42", t0);

        // Exactly TTL old is still active
        assert_eq!(presence.sweep(t0 + Duration::from_secs(10)).total, 1);

        let snapshot = presence.sweep(t0 + Duration::from_millis(10_001));
        assert_eq!(snapshot.total, 0);
        assert!(!presence.is_active("pr9", "runner42"));
    }

    #[test]
    fn test_emptied_trail_reports_zero() {
        let presence = PresenceTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        presence.touch("pr9", "runner42", t0);

        let later = t0 + Duration::from_secs(5);
        presence.touch("pr21", "runner1", later);

        let snapshot = presence.sweep(later);
        assert_eq!(snapshot.by_trail.get("pr9"), Some(&0));
        assert_eq!(snapshot.by_trail.get("pr21"), Some(&1));
        assert_eq!(snapshot.total, 1);
        assert_eq!(presence.active_count("pr9"), 0);
    }

    #[test]
    fn test_default_ttl() {
        let presence = PresenceTracker::default();
        assert_eq!(presence.ttl(), Duration::from_millis(180_000));
    }
}
