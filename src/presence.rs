//! Heartbeat-driven robot presence registry.
//!
//! Robots are keyed by `(team, robot)` and indexed a second time by the
//! instant of their last beacon. Stale entries are evicted lazily at the
//! start of every operation by popping the oldest beacons off the time index;
//! there is no background sweeper.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::TimeDelta;
use tokio::time::Instant;

/// One live robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotPresence {
    /// Team name
    pub team: String,
    /// Robot name
    pub robot: String,
    /// Robot clock minus referee clock at the last beacon
    pub clock_skew: TimeDelta,
    /// When the last beacon was observed
    pub last_beacon: Instant,
}

/// Registry of robots that have announced themselves recently.
#[derive(Debug)]
pub struct PresenceRegistry {
    timeout: Duration,
    by_team: BTreeMap<String, BTreeMap<String, RobotPresence>>,
    // (beacon, team, robot) keeps equal instants from colliding
    by_beacon: BTreeSet<(Instant, String, String)>,
}

impl PresenceRegistry {
    /// Creates an empty registry that forgets robots silent for longer than
    /// `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            by_team: BTreeMap::new(),
            by_beacon: BTreeSet::new(),
        }
    }

    /// Eviction horizon.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Upserts a robot, replacing its skew and re-keying its beacon time.
    pub fn record_heartbeat(&mut self, team: &str, robot: &str, skew: TimeDelta, observed: Instant) {
        self.evict(observed);

        let robots = self.by_team.entry(team.to_string()).or_default();
        if let Some(existing) = robots.get_mut(robot) {
            self.by_beacon
                .remove(&(existing.last_beacon, team.to_string(), robot.to_string()));
            existing.clock_skew = skew;
            existing.last_beacon = observed;
        } else {
            robots.insert(
                robot.to_string(),
                RobotPresence {
                    team: team.to_string(),
                    robot: robot.to_string(),
                    clock_skew: skew,
                    last_beacon: observed,
                },
            );
        }
        self.by_beacon
            .insert((observed, team.to_string(), robot.to_string()));
    }

    /// First live robot of every team, by robot-name ordering.
    pub fn list_active_by_team(&mut self, now: Instant) -> Vec<RobotPresence> {
        self.evict(now);
        self.by_team
            .values()
            .filter_map(|robots| robots.values().next().cloned())
            .collect()
    }

    /// Every live robot, grouped by team.
    pub fn all_by_team(&mut self, now: Instant) -> Vec<RobotPresence> {
        self.evict(now);
        self.by_team
            .values()
            .flat_map(|robots| robots.values().cloned())
            .collect()
    }

    /// Best-effort single live robot for `team`.
    pub fn get(&mut self, team: &str, now: Instant) -> Option<RobotPresence> {
        self.evict(now);
        self.by_team
            .get(team)
            .and_then(|robots| robots.values().next().cloned())
    }

    /// Number of robots currently held, without evicting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_team.values().map(BTreeMap::len).sum()
    }

    /// Whether no robot is currently held, without evicting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_team.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((beacon, _, _)) = self.by_beacon.first() {
            if *beacon + self.timeout >= now {
                break;
            }
            let Some((_, team, robot)) = self.by_beacon.pop_first() else {
                break;
            };
            if let Some(robots) = self.by_team.get_mut(&team) {
                robots.remove(&robot);
                if robots.is_empty() {
                    self.by_team.remove(&team);
                }
            }
            tracing::debug!(%team, %robot, "robot presence expired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn robot_expires_after_timeout() {
        let t0 = Instant::now();
        let mut registry = PresenceRegistry::new(TIMEOUT);
        registry.record_heartbeat("t1", "a", TimeDelta::zero(), t0);

        assert_eq!(registry.all_by_team(t0 + secs(29)).len(), 1);
        assert!(registry.all_by_team(t0 + secs(31)).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn repeated_heartbeats_do_not_grow_registry() {
        let t0 = Instant::now();
        let mut registry = PresenceRegistry::new(TIMEOUT);
        for n in 0..10 {
            registry.record_heartbeat("t1", "a", TimeDelta::milliseconds(n), t0 + secs(n as u64));
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_beacon.len(), 1);

        let robot = registry.get("t1", t0 + secs(35)).unwrap();
        assert_eq!(robot.clock_skew, TimeDelta::milliseconds(9));
    }

    #[test]
    fn upsert_rekeys_beacon_so_refreshed_robot_survives() {
        let t0 = Instant::now();
        let mut registry = PresenceRegistry::new(TIMEOUT);
        registry.record_heartbeat("t1", "a", TimeDelta::zero(), t0);
        registry.record_heartbeat("t1", "b", TimeDelta::zero(), t0 + secs(1));
        registry.record_heartbeat("t1", "a", TimeDelta::zero(), t0 + secs(20));

        let live = registry.all_by_team(t0 + secs(40));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].robot, "a");
    }

    #[test]
    fn list_active_returns_first_robot_per_team() {
        let t0 = Instant::now();
        let mut registry = PresenceRegistry::new(TIMEOUT);
        registry.record_heartbeat("t2", "zeta", TimeDelta::zero(), t0);
        registry.record_heartbeat("t1", "beta", TimeDelta::zero(), t0);
        registry.record_heartbeat("t1", "alpha", TimeDelta::zero(), t0);

        let active = registry.list_active_by_team(t0);
        let names: Vec<_> = active
            .iter()
            .map(|p| (p.team.as_str(), p.robot.as_str()))
            .collect();
        assert_eq!(names, vec![("t1", "alpha"), ("t2", "zeta")]);

        let all = registry.all_by_team(t0);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn equal_beacon_instants_are_kept_apart() {
        let t0 = Instant::now();
        let mut registry = PresenceRegistry::new(TIMEOUT);
        registry.record_heartbeat("t1", "a", TimeDelta::zero(), t0);
        registry.record_heartbeat("t2", "a", TimeDelta::zero(), t0);
        assert_eq!(registry.by_beacon.len(), 2);
        assert!(registry.get("t2", t0 + secs(30)).is_some());
        assert!(registry.get("t2", t0 + secs(31)).is_none());
        assert!(registry.by_beacon.is_empty());
    }

    proptest! {
        #[test]
        fn reads_match_last_beacon_per_robot(
            beats in proptest::collection::vec((0u8..3, 0u8..4, 0u64..120), 1..40),
            query_offset in 0u64..200,
        ) {
            let t0 = Instant::now();
            let mut registry = PresenceRegistry::new(TIMEOUT);
            let mut sorted = beats.clone();
            sorted.sort_by_key(|(_, _, at)| *at);

            let mut last: BTreeMap<(String, String), u64> = BTreeMap::new();
            for (team, robot, at) in &sorted {
                let (team, robot) = (format!("t{team}"), format!("r{robot}"));
                registry.record_heartbeat(&team, &robot, TimeDelta::zero(), t0 + secs(*at));
                last.insert((team, robot), *at);
            }
            prop_assert_eq!(registry.len(), registry.by_beacon.len());

            let newest = sorted.last().map_or(0, |(_, _, at)| *at);
            let query = newest + query_offset;
            let live: BTreeSet<(String, String)> = registry
                .all_by_team(t0 + secs(query))
                .into_iter()
                .map(|p| (p.team, p.robot))
                .collect();
            for (key, at) in &last {
                let expected = at + TIMEOUT.as_secs() >= query;
                prop_assert_eq!(live.contains(key), expected);
            }
            prop_assert_eq!(registry.len(), registry.by_beacon.len());
        }
    }
}
