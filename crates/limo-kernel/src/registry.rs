//! [`RobotRegistry`] – live robot table.
//!
//! A robot is *live* from its first heartbeat until a [`RobotRegistry::sweep`]
//! finds that `now - last_heartbeat_at` exceeds the keep-alive timeout.
//! Heartbeats may arrive concurrently, duplicated or out of order; the stored
//! timestamp only ever moves forward.
//!
//! Every live robot owns a [`CancellationToken`] handed out on registration.
//! Listeners bound to that robot (robot-scoped bus subscriptions) watch the
//! token; eviction cancels it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chrono::Utc;
//! use limo_kernel::registry::{Heartbeat, RobotRegistry};
//!
//! let registry = RobotRegistry::new(Duration::from_secs(10));
//! let t0 = Utc::now();
//!
//! assert!(matches!(registry.heartbeat("r1", t0), Heartbeat::Registered { .. }));
//! assert!(matches!(registry.heartbeat("r1", t0), Heartbeat::Refreshed));
//!
//! assert!(registry.sweep(t0 + chrono::Duration::seconds(10)).is_empty());
//! assert_eq!(registry.sweep(t0 + chrono::Duration::seconds(11)).len(), 1);
//! assert!(!registry.contains("r1"));
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use limo_types::{Goal, Pose};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keep-alive timeout used when none is configured.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

// ────────────────────────────────────────────────────────────────────────────
// Outcomes
// ────────────────────────────────────────────────────────────────────────────

/// Result of applying one heartbeat.
#[derive(Debug, Clone)]
pub enum Heartbeat {
    /// The robot was absent and is now live.  Robot-scoped listeners should
    /// stop when `listener` is cancelled.
    Registered { listener: CancellationToken },
    /// The robot was already live.
    Refreshed,
}

/// A robot removed by [`RobotRegistry::sweep`].
#[derive(Debug, Clone, PartialEq)]
pub struct Evicted {
    pub robot_id: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub had_goal: bool,
}

/// Point-in-time copy of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotSnapshot {
    pub id: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_position: Option<Pose>,
    pub last_goal: Option<Goal>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct RobotEntry {
    last_heartbeat_at: DateTime<Utc>,
    last_position: Option<Pose>,
    last_goal: Option<Goal>,
    listener: CancellationToken,
}

// ────────────────────────────────────────────────────────────────────────────
// RobotRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Concurrent table of live robots.
///
/// All methods take `&self`; share it behind an `Arc`.  No method blocks on
/// anything but the table's own shard locks, and no lock outlives the call.
pub struct RobotRegistry {
    robots: DashMap<String, RobotEntry>,
    keep_alive_timeout: TimeDelta,
    root: CancellationToken,
}

impl RobotRegistry {
    /// Create an empty registry evicting robots silent for longer than
    /// `keep_alive_timeout`.
    pub fn new(keep_alive_timeout: Duration) -> Self {
        Self::with_root_token(keep_alive_timeout, CancellationToken::new())
    }

    /// Like [`new`][Self::new], but every per-robot listener token is a child
    /// of `root`, so cancelling `root` stops all robot-scoped listeners.
    pub fn with_root_token(keep_alive_timeout: Duration, root: CancellationToken) -> Self {
        Self {
            robots: DashMap::new(),
            keep_alive_timeout: TimeDelta::from_std(keep_alive_timeout).unwrap_or(TimeDelta::MAX),
            root,
        }
    }

    pub fn keep_alive_timeout(&self) -> TimeDelta {
        self.keep_alive_timeout
    }

    /// Apply a heartbeat received at `at`.
    ///
    /// An unknown id becomes live.  A known id has its timestamp raised to
    /// `at` unless it already holds a later one.
    pub fn heartbeat(&self, robot_id: &str, at: DateTime<Utc>) -> Heartbeat {
        match self.robots.entry(robot_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if at > entry.last_heartbeat_at {
                    entry.last_heartbeat_at = at;
                }
                Heartbeat::Refreshed
            }
            Entry::Vacant(vacant) => {
                let listener = self.root.child_token();
                vacant.insert(RobotEntry {
                    last_heartbeat_at: at,
                    last_position: None,
                    last_goal: None,
                    listener: listener.clone(),
                });
                Heartbeat::Registered { listener }
            }
        }
    }

    /// Record the latest position of a live robot.
    ///
    /// Returns `false` when the robot is not live; the position is dropped.
    pub fn update_position(&self, robot_id: &str, pose: Pose) -> bool {
        match self.robots.get_mut(robot_id) {
            Some(mut entry) => {
                entry.last_position = Some(pose);
                true
            }
            None => false,
        }
    }

    /// Set (`Some`) or clear (`None`) the goal of a live robot.
    ///
    /// Returns `false` when the robot is not live.
    pub fn set_goal(&self, robot_id: &str, goal: Option<Goal>) -> bool {
        match self.robots.get_mut(robot_id) {
            Some(mut entry) => {
                entry.last_goal = goal;
                true
            }
            None => false,
        }
    }

    /// Evict every robot whose last heartbeat is more than the keep-alive
    /// timeout before `now`, cancelling its listener token.
    ///
    /// A heartbeat racing with the sweep either lands first (and the robot
    /// survives) or lands after removal (and re-registers the robot).
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Evicted> {
        let candidates: Vec<String> = self
            .robots
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some((robot_id, entry)) = self
                .robots
                .remove_if(&id, |_, entry| self.is_expired(entry, now))
            {
                entry.listener.cancel();
                debug!(robot_id = %robot_id, last_heartbeat_at = %entry.last_heartbeat_at, "robot evicted");
                evicted.push(Evicted {
                    robot_id,
                    last_heartbeat_at: entry.last_heartbeat_at,
                    had_goal: entry.last_goal.is_some(),
                });
            }
        }
        evicted
    }

    pub fn contains(&self, robot_id: &str) -> bool {
        self.robots.contains_key(robot_id)
    }

    pub fn len(&self) -> usize {
        self.robots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.robots.is_empty()
    }

    /// Copy of one robot's entry.
    pub fn get(&self, robot_id: &str) -> Option<RobotSnapshot> {
        self.robots
            .get(robot_id)
            .map(|entry| snapshot_of(entry.key(), entry.value()))
    }

    /// Copies of every live robot, ordered by id.
    pub fn snapshot(&self) -> Vec<RobotSnapshot> {
        let mut robots: Vec<RobotSnapshot> = self
            .robots
            .iter()
            .map(|entry| snapshot_of(entry.key(), entry.value()))
            .collect();
        robots.sort_by(|a, b| a.id.cmp(&b.id));
        robots
    }

    fn is_expired(&self, entry: &RobotEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.last_heartbeat_at) > self.keep_alive_timeout
    }
}

fn snapshot_of(id: &str, entry: &RobotEntry) -> RobotSnapshot {
    RobotSnapshot {
        id: id.to_string(),
        last_heartbeat_at: entry.last_heartbeat_at,
        last_position: entry.last_position,
        last_goal: entry.last_goal,
    }
}

impl Default for RobotRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_ALIVE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ms(n: i64) -> TimeDelta {
        TimeDelta::milliseconds(n)
    }

    #[test]
    fn first_heartbeat_registers() {
        let registry = RobotRegistry::default();
        let t0 = Utc::now();
        assert!(matches!(
            registry.heartbeat("r1", t0),
            Heartbeat::Registered { .. }
        ));
        assert!(registry.contains("r1"));
        assert_eq!(registry.len(), 1);
        let robot = registry.get("r1").unwrap();
        assert_eq!(robot.last_heartbeat_at, t0);
        assert!(robot.last_position.is_none());
        assert!(robot.last_goal.is_none());
    }

    #[test]
    fn later_heartbeat_only_refreshes_timestamp() {
        let registry = RobotRegistry::default();
        let t0 = Utc::now();
        registry.heartbeat("r1", t0);
        registry.update_position("r1", Pose::new(1.0, 2.0, 0.5));
        assert!(matches!(
            registry.heartbeat("r1", t0 + ms(500)),
            Heartbeat::Refreshed
        ));
        let robot = registry.get("r1").unwrap();
        assert_eq!(robot.last_heartbeat_at, t0 + ms(500));
        assert_eq!(robot.last_position, Some(Pose::new(1.0, 2.0, 0.5)));
    }

    #[test]
    fn stale_heartbeat_does_not_move_timestamp_back() {
        let registry = RobotRegistry::default();
        let t0 = Utc::now();
        registry.heartbeat("r1", t0 + ms(900));
        registry.heartbeat("r1", t0);
        assert_eq!(registry.get("r1").unwrap().last_heartbeat_at, t0 + ms(900));
    }

    #[test]
    fn eviction_never_happens_before_timeout() {
        let registry = RobotRegistry::new(Duration::from_secs(10));
        let t0 = Utc::now();
        registry.heartbeat("r1", t0);

        assert!(registry.sweep(t0).is_empty());
        assert!(registry.sweep(t0 + ms(9_999)).is_empty());
        assert!(registry.sweep(t0 + ms(10_000)).is_empty());
        assert!(registry.contains("r1"));

        let evicted = registry.sweep(t0 + ms(10_001));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].robot_id, "r1");
        assert_eq!(evicted[0].last_heartbeat_at, t0);
        assert!(!registry.contains("r1"));
    }

    #[test]
    fn sweep_only_evicts_silent_robots() {
        let registry = RobotRegistry::new(Duration::from_secs(1));
        let t0 = Utc::now();
        registry.heartbeat("quiet", t0);
        registry.heartbeat("chatty", t0);
        registry.heartbeat("chatty", t0 + ms(1_500));

        let evicted = registry.sweep(t0 + ms(2_000));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].robot_id, "quiet");
        assert!(registry.contains("chatty"));
    }

    #[test]
    fn eviction_cancels_listener_token() {
        let registry = RobotRegistry::new(Duration::from_secs(1));
        let t0 = Utc::now();
        let Heartbeat::Registered { listener } = registry.heartbeat("r1", t0) else {
            panic!("expected registration");
        };
        assert!(!listener.is_cancelled());
        registry.sweep(t0 + ms(1_001));
        assert!(listener.is_cancelled());
    }

    #[test]
    fn root_token_cancels_every_listener() {
        let root = CancellationToken::new();
        let registry = RobotRegistry::with_root_token(Duration::from_secs(1), root.clone());
        let t0 = Utc::now();
        let Heartbeat::Registered { listener } = registry.heartbeat("r1", t0) else {
            panic!("expected registration");
        };
        root.cancel();
        assert!(listener.is_cancelled());
    }

    #[test]
    fn heartbeat_after_eviction_registers_again() {
        let registry = RobotRegistry::new(Duration::from_secs(1));
        let t0 = Utc::now();
        registry.heartbeat("r1", t0);
        registry.sweep(t0 + ms(5_000));
        assert!(matches!(
            registry.heartbeat("r1", t0 + ms(5_001)),
            Heartbeat::Registered { .. }
        ));
    }

    #[test]
    fn position_and_goal_require_live_robot() {
        let registry = RobotRegistry::default();
        assert!(!registry.update_position("ghost", Pose::new(0.0, 0.0, 0.0)));
        assert!(!registry.set_goal("ghost", Some(Goal::new(1.0, 1.0))));

        registry.heartbeat("r1", Utc::now());
        assert!(registry.set_goal("r1", Some(Goal::new(1.0, 1.0))));
        assert_eq!(registry.get("r1").unwrap().last_goal, Some(Goal::new(1.0, 1.0)));
        assert!(registry.set_goal("r1", None));
        assert_eq!(registry.get("r1").unwrap().last_goal, None);
    }

    #[test]
    fn evicted_reports_goal_presence() {
        let registry = RobotRegistry::new(Duration::from_secs(1));
        let t0 = Utc::now();
        registry.heartbeat("r1", t0);
        registry.set_goal("r1", Some(Goal::new(3.0, 4.0)));
        let evicted = registry.sweep(t0 + ms(1_001));
        assert!(evicted[0].had_goal);
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let registry = RobotRegistry::default();
        let t0 = Utc::now();
        registry.heartbeat("r2", t0);
        registry.heartbeat("r1", t0);
        registry.heartbeat("r3", t0);
        let ids: Vec<String> = registry.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn concurrent_heartbeats_keep_the_maximum() {
        let registry = Arc::new(RobotRegistry::default());
        let t0 = Utc::now();

        thread::scope(|scope| {
            for worker in 0..8i64 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    // Each worker delivers a shuffled slice of timestamps.
                    for i in 0..500i64 {
                        let offset = (i * 7919 + worker * 104_729) % 4_000;
                        registry.heartbeat("r1", t0 + ms(offset));
                    }
                });
            }
        });

        let max_delivered = (0..8i64)
            .flat_map(|w| (0..500i64).map(move |i| (i * 7919 + w * 104_729) % 4_000))
            .max()
            .unwrap();
        assert_eq!(
            registry.get("r1").unwrap().last_heartbeat_at,
            t0 + ms(max_delivered)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_sweep_and_heartbeats_are_safe() {
        let registry = Arc::new(RobotRegistry::new(Duration::from_millis(100)));
        let t0 = Utc::now();

        thread::scope(|scope| {
            let beating = Arc::clone(&registry);
            scope.spawn(move || {
                for i in 0..1_000i64 {
                    beating.heartbeat(&format!("r{}", i % 10), t0 + ms(i));
                }
            });
            let sweeping = Arc::clone(&registry);
            scope.spawn(move || {
                for i in 0..1_000i64 {
                    sweeping.sweep(t0 + ms(i));
                }
            });
        });

        // Every robot heartbeated at most 100 ms before t0 + 1s.
        assert!(registry.sweep(t0 + ms(1_000)).is_empty());
        assert_eq!(registry.len(), 10);
    }
}
