//! Process-scoped state shared by every trial.
//!
//! Owned by the [`crate::coordinator::Coordinator`] and handed to trials by
//! `Arc`. The presence registry and the benchmarking-robot ownership map are
//! the only structures trials mutate; each call leaves them consistent.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::TimeDelta;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{Passwords, Settings};
use crate::messages::DevicesState;
use crate::observability::metrics;
use crate::presence::{PresenceRegistry, RobotPresence};

/// Robot and private port currently owned by a trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotClaim {
    /// Robot name
    pub robot: String,
    /// Private channel port
    pub port: u16,
}

/// State shared across trials.
#[derive(Debug)]
pub struct SharedState {
    presence: Mutex<PresenceRegistry>,
    benchmarking: DashMap<String, RobotClaim>,
    private_port: AtomicU16,
    devices: Mutex<DevicesState>,
    tablet_display_map: AtomicBool,
    run_uuid: Uuid,
    settings: Settings,
    passwords: Passwords,
}

impl SharedState {
    /// Creates the shared state with a fresh run id.
    #[must_use]
    pub fn new(settings: Settings, passwords: Passwords) -> Self {
        Self {
            presence: Mutex::new(PresenceRegistry::new(settings.robot_timeout)),
            benchmarking: DashMap::new(),
            private_port: AtomicU16::new(settings.rsbb_port),
            devices: Mutex::new(DevicesState::default()),
            tablet_display_map: AtomicBool::new(false),
            run_uuid: Uuid::new_v4(),
            settings,
            passwords,
        }
    }

    /// Settings the process was started with.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Identifier of this controller run, shared by every audit log.
    #[must_use]
    pub const fn run_uuid(&self) -> Uuid {
        self.run_uuid
    }

    /// Secret of `team`.
    #[must_use]
    pub fn password(&self, team: &str) -> Option<&str> {
        self.passwords.get(team)
    }

    /// Next private port to try. Counts up from the public port and starts
    /// over just above it once `u16::MAX` is used, so 0 is never handed out.
    pub fn next_private_port(&self) -> u16 {
        let base = self.settings.rsbb_port;
        let step = |port: u16| port.checked_add(1).unwrap_or_else(|| base.checked_add(1).unwrap_or(1));
        let previous = self
            .private_port
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |port| Some(step(port)))
            .unwrap_or_else(|port| port);
        step(previous)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// # Panics
    ///
    /// Panics if the presence lock is poisoned.
    #[allow(clippy::expect_used)]
    fn presence(&self) -> MutexGuard<'_, PresenceRegistry> {
        self.presence.lock().expect("presence lock poisoned")
    }

    /// Records a heartbeat or beacon and refreshes the presence gauge.
    pub fn record_heartbeat(&self, team: &str, robot: &str, skew: TimeDelta, observed: Instant) {
        let mut presence = self.presence();
        presence.record_heartbeat(team, robot, skew, observed);
        metrics::set_active_robots(presence.len());
    }

    /// One live robot per team.
    #[must_use]
    pub fn active_robots(&self, now: Instant) -> Vec<RobotPresence> {
        self.presence().list_active_by_team(now)
    }

    /// Every live robot.
    #[must_use]
    pub fn all_robots(&self, now: Instant) -> Vec<RobotPresence> {
        self.presence().all_by_team(now)
    }

    /// Live robot of `team`, if any.
    #[must_use]
    pub fn robot_for(&self, team: &str, now: Instant) -> Option<RobotPresence> {
        self.presence().get(team, now)
    }

    // ------------------------------------------------------------------
    // Benchmarking robots
    // ------------------------------------------------------------------

    /// Marks `team` as benchmarking with `robot` on `port`. Returns `false`
    /// and changes nothing if the team already has a claim.
    #[must_use]
    pub fn claim(&self, team: &str, robot: &str, port: u16) -> bool {
        match self.benchmarking.entry(team.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(RobotClaim {
                    robot: robot.to_string(),
                    port,
                });
                true
            }
        }
    }

    /// Releases the claim of `team` if it is still the one on `port`.
    pub fn release(&self, team: &str, port: u16) {
        self.benchmarking.remove_if(team, |_, claim| claim.port == port);
    }

    /// Whether `team` is currently benchmarking.
    #[must_use]
    pub fn is_benchmarking(&self, team: &str) -> bool {
        self.benchmarking.contains_key(team)
    }

    /// Current claim of `team`.
    #[must_use]
    pub fn claim_of(&self, team: &str) -> Option<RobotClaim> {
        self.benchmarking.get(team).map(|c| c.value().clone())
    }

    // ------------------------------------------------------------------
    // Smart environment
    // ------------------------------------------------------------------

    /// # Panics
    ///
    /// Panics if the devices lock is poisoned.
    #[allow(clippy::expect_used)]
    fn devices_lock(&self) -> MutexGuard<'_, DevicesState> {
        self.devices.lock().expect("devices lock poisoned")
    }

    /// Last reported device state.
    #[must_use]
    pub fn devices(&self) -> DevicesState {
        *self.devices_lock()
    }

    /// Replaces the last reported device state.
    pub fn set_devices(&self, state: DevicesState) {
        *self.devices_lock() = state;
    }

    /// Whether the tablet currently shows the map.
    #[must_use]
    pub fn tablet_display_map(&self) -> bool {
        self.tablet_display_map.load(Ordering::Relaxed)
    }

    /// Sets the tablet map flag, returning `true` if it changed.
    pub fn set_tablet_display_map(&self, value: bool) -> bool {
        self.tablet_display_map.swap(value, Ordering::Relaxed) != value
    }
}
