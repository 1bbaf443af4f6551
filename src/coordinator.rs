//! Zone coordinator.
//!
//! Owns the process-scoped [`SharedState`] and one [`TrialHandle`] per
//! connected zone. Operator commands are forwarded to the zone's task; no
//! map reference is ever held across an `.await`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Bus, DEVICES_STATE_TOPIC};
use crate::config::{RsbbConfig, TrialEvent, TrialKind};
use crate::error::TrialError;
use crate::messages::{DevicesState, RobotBeacon};
use crate::observability::metrics;
use crate::shared::SharedState;
use crate::transport::ChannelFactory;
use crate::trial::{Commander, EndHook, ScoreUpdate, StatusView, Trial, TrialCommand, TrialHandle, TrialSetup};

/// One scheduled event as listed to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledEvent {
    /// Zone identifier
    pub id: String,
    /// Team name
    pub team: String,
    /// Round number
    pub round: u32,
    /// Run number
    pub run: u32,
    /// Benchmark code
    pub benchmark: String,
    /// Benchmark display name
    pub name: String,
    /// Trial kind
    pub kind: TrialKind,
    /// Robot override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot: Option<String>,
    /// Whether a zone is open for it
    pub connected: bool,
}

/// One present robot as listed to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotView {
    /// Team name
    pub team: String,
    /// Robot name
    pub robot: String,
    /// Robot clock minus referee clock, in seconds
    pub clock_skew: f64,
    /// Seconds since the last beacon or heartbeat
    pub last_seen: f64,
    /// Whether the team is running a trial
    pub benchmarking: bool,
}

/// Connects, drives and disposes zones.
#[derive(Debug)]
pub struct Coordinator {
    config: Arc<RsbbConfig>,
    shared: Arc<SharedState>,
    bus: Arc<dyn Bus>,
    factory: Arc<dyn ChannelFactory>,
    zones: Arc<DashMap<String, TrialHandle>>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Creates a coordinator with no open zones. Trial tasks are cancelled
    /// together with `cancel`.
    #[must_use]
    pub fn new(
        config: Arc<RsbbConfig>,
        bus: Arc<dyn Bus>,
        factory: Arc<dyn ChannelFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(SharedState::new(
            config.settings.clone(),
            config.passwords.clone(),
        ));
        info!(run = %shared.run_uuid(), events = config.schedule.len(), "coordinator ready");
        Self {
            config,
            shared,
            bus,
            factory,
            zones: Arc::new(DashMap::new()),
            cancel,
        }
    }

    /// Process state shared with the trials.
    #[must_use]
    pub const fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// The bus trials publish on.
    #[must_use]
    pub const fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &Arc<RsbbConfig> {
        &self.config
    }

    /// Scheduled event with identifier `id`.
    #[must_use]
    pub fn event(&self, id: &str) -> Option<&TrialEvent> {
        self.config.schedule.iter().find(|event| event.id() == id)
    }

    /// The schedule with connection flags.
    #[must_use]
    pub fn schedule(&self) -> Vec<ScheduledEvent> {
        self.config
            .schedule
            .iter()
            .map(|event| {
                let id = event.id();
                ScheduledEvent {
                    connected: self.zones.contains_key(&id),
                    id,
                    team: event.team.clone(),
                    round: event.round,
                    run: event.run,
                    benchmark: event.benchmark.code.clone(),
                    name: event.benchmark.name.clone(),
                    kind: event.benchmark.kind,
                    robot: event.robot.clone(),
                }
            })
            .collect()
    }

    /// Identifiers of the open zones, sorted.
    #[must_use]
    pub fn zone_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.zones.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------
    // Zone lifecycle
    // ------------------------------------------------------------------

    /// Opens a zone for scheduled event `id` and spawns its trial.
    ///
    /// # Errors
    ///
    /// - [`TrialError::UnknownEvent`] if `id` is not scheduled
    /// - [`TrialError::ZoneExists`] if the zone is already open
    /// - [`TrialError::NoRobot`] if no robot of the team is present
    /// - [`TrialError::TeamBusy`] if the team already runs a trial
    pub async fn connect(&self, id: &str) -> Result<(), TrialError> {
        let event = self
            .event(id)
            .cloned()
            .ok_or_else(|| TrialError::UnknownEvent(id.to_string()))?;
        if self.zones.contains_key(id) {
            return Err(TrialError::ZoneExists(id.to_string()));
        }

        let now = Instant::now();
        let kind = event.benchmark.kind;
        let robot = match kind {
            TrialKind::Fleet => None,
            TrialKind::Simple | TrialKind::External => Some(
                event
                    .robot
                    .clone()
                    .or_else(|| self.shared.robot_for(&event.team, now).map(|p| p.robot))
                    .ok_or_else(|| TrialError::NoRobot {
                        team: event.team.clone(),
                    })?,
            ),
        };

        let token = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let trial = Trial::connect(
            TrialSetup {
                zone: id.to_string(),
                event,
                robot,
                shared: &self.shared,
                factory: self.factory.as_ref(),
                bus: &self.bus,
                on_end: self.end_hook(id, token),
                inbound: inbound_tx,
            },
            now,
        )
        .await?;

        let bmbox = trial.bmbox_topic().map(|topic| self.bus.subscribe(&topic));
        let handle = TrialHandle::spawn(
            trial,
            token,
            inbound_rx,
            bmbox,
            self.shared.settings().state_retransmit_interval,
            self.cancel.child_token(),
        );

        let conflict = match self.zones.entry(id.to_string()) {
            Entry::Occupied(_) => Some(handle),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                None
            }
        };
        if let Some(handle) = conflict {
            handle.shutdown().await;
            return Err(TrialError::ZoneExists(id.to_string()));
        }

        info!(zone = id, kind = kind.as_str(), "zone connected");
        metrics::record_trial_started(kind.as_str());
        metrics::set_zones_active(self.zones.len());
        Ok(())
    }

    fn end_hook(&self, id: &str, token: Uuid) -> EndHook {
        let zones = Arc::clone(&self.zones);
        let zone = id.to_string();
        Box::new(move || {
            if zones.remove_if(&zone, |_, handle| handle.token() == token).is_some() {
                debug!(zone, "zone ended itself");
            }
            metrics::set_zones_active(zones.len());
        })
    }

    /// Closes zone `id`, waiting until its trial has released everything.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] if no such zone is open.
    pub async fn disconnect(&self, id: &str) -> Result<(), TrialError> {
        let (_, handle) = self
            .zones
            .remove(id)
            .ok_or_else(|| TrialError::UnknownZone(id.to_string()))?;
        handle.shutdown().await;
        info!(zone = id, "zone disconnected");
        metrics::set_zones_active(self.zones.len());
        Ok(())
    }

    /// Closes every zone.
    pub async fn shutdown(&self) {
        for id in self.zone_ids() {
            if let Some((_, handle)) = self.zones.remove(&id) {
                handle.shutdown().await;
            }
        }
        metrics::set_zones_active(0);
    }

    // ------------------------------------------------------------------
    // Operator commands
    // ------------------------------------------------------------------

    fn commander(&self, id: &str) -> Result<Commander, TrialError> {
        self.zones
            .get(id)
            .map(|handle| handle.commander())
            .ok_or_else(|| TrialError::UnknownZone(id.to_string()))
    }

    fn send(&self, id: &str, command: TrialCommand) -> Result<(), TrialError> {
        self.commander(id)?.send(command)
    }

    /// Starts zone `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub fn start(&self, id: &str) -> Result<(), TrialError> {
        self.send(id, TrialCommand::Start)
    }

    /// Stops zone `id`; a second stop ends it.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub fn stop(&self, id: &str) -> Result<(), TrialError> {
        self.send(id, TrialCommand::Stop)
    }

    /// Records a score in zone `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub fn score(&self, id: &str, update: ScoreUpdate) -> Result<(), TrialError> {
        self.send(id, TrialCommand::Score(update))
    }

    /// Reports the manual operation done in zone `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub fn manual_operation_complete(&self, id: &str) -> Result<(), TrialError> {
        self.send(id, TrialCommand::ManualOperationComplete)
    }

    /// Reports the switch input done in zone `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub fn omf_complete(&self, id: &str) -> Result<(), TrialError> {
        self.send(id, TrialCommand::OmfComplete)
    }

    /// Reports damaged switches in zone `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub fn omf_damaged(&self, id: &str, damaged: u8) -> Result<(), TrialError> {
        self.send(id, TrialCommand::OmfDamaged(damaged))
    }

    /// Toggles a switch in zone `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub fn omf_button(&self, id: &str, button: u8) -> Result<(), TrialError> {
        self.send(id, TrialCommand::OmfButton(button))
    }

    /// Status of zone `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::UnknownZone`] or [`TrialError::Stopped`].
    pub async fn snapshot(&self, id: &str) -> Result<StatusView, TrialError> {
        let commander = self.commander(id)?;
        commander.snapshot().await
    }

    /// Status of every open zone, sorted by zone.
    pub async fn snapshots(&self) -> Vec<StatusView> {
        let commanders: Vec<Commander> = self.zones.iter().map(|e| e.commander()).collect();
        let mut views = Vec::with_capacity(commanders.len());
        for commander in commanders {
            match commander.snapshot().await {
                Ok(view) => views.push(view),
                Err(error) => debug!(zone = commander.zone(), %error, "zone vanished while listing"),
            }
        }
        views.sort_by(|a, b| a.zone.cmp(&b.zone));
        views
    }

    // ------------------------------------------------------------------
    // Robots and devices
    // ------------------------------------------------------------------

    /// Every live robot.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn active_robots(&self) -> Vec<RobotView> {
        let now = Instant::now();
        self.shared
            .all_robots(now)
            .into_iter()
            .map(|presence| RobotView {
                benchmarking: self.shared.is_benchmarking(&presence.team),
                clock_skew: presence.clock_skew.num_milliseconds() as f64 / 1000.0,
                last_seen: now.saturating_duration_since(presence.last_beacon).as_secs_f64(),
                team: presence.team,
                robot: presence.robot,
            })
            .collect()
    }

    /// Records a public-channel beacon.
    pub fn record_beacon(&self, beacon: &RobotBeacon) {
        let skew = beacon.time.skew_from(Utc::now());
        self.shared
            .record_heartbeat(&beacon.team_name, &beacon.robot_name, skew, Instant::now());
        metrics::record_heartbeat(false);
    }

    /// Mirrors the devices node's state topic into the shared state until
    /// cancelled.
    #[must_use]
    pub fn track_devices(&self) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe(DEVICES_STATE_TOPIC);
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let value = rx.borrow_and_update().clone();
                        let Some(value) = value else { continue };
                        match serde_json::from_value::<DevicesState>(value) {
                            Ok(state) => shared.set_devices(state),
                            Err(error) => warn!(%error, "ignoring malformed devices state"),
                        }
                    }
                }
            }
        })
    }
}
