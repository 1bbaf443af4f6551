//! Trials: the per-zone benchmark state machines.
//!
//! Three kinds share the [`lifecycle`] contract: [`simple`] (one robot),
//! [`external`] (one robot plus a benchmarking box) and [`fleet`] (every
//! present robot). [`Trial`] is the closed set of kinds; [`runtime`] drives
//! one of them from its own task.

pub mod external;
pub mod fleet;
pub mod lifecycle;
pub mod link;
pub mod runtime;
pub mod simple;
pub mod status;

pub use external::ExternalTrial;
pub use fleet::FleetTrial;
pub use lifecycle::{EndHook, Lifecycle, Phase};
pub use link::RobotLink;
pub use runtime::{Commander, ScoreUpdate, TrialCommand, TrialHandle};
pub use simple::SimpleTrial;
pub use status::{OmfPanel, ScoreGroup, ScoreRow, StatusView};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::bus::Bus;
use crate::config::{TrialEvent, TrialKind};
use crate::error::TrialError;
use crate::shared::SharedState;
use crate::transport::{ChannelFactory, Inbound, InboundSink, RobotInbound};

use lifecycle::Benchmark;

/// Everything needed to build a trial.
pub struct TrialSetup<'a> {
    /// Zone identifier
    pub zone: String,
    /// Event to run
    pub event: TrialEvent,
    /// Robot to link (single-robot kinds only)
    pub robot: Option<String>,
    /// Process state
    pub shared: &'a Arc<SharedState>,
    /// Private channel factory
    pub factory: &'a dyn ChannelFactory,
    /// Bus to the benchmarking boxes and devices
    pub bus: &'a Arc<dyn Bus>,
    /// Called once when the trial ends itself
    pub on_end: EndHook,
    /// Where channels deliver inbound robot traffic
    pub inbound: mpsc::UnboundedSender<RobotInbound>,
}

/// A running trial of any kind.
#[derive(Debug)]
pub enum Trial {
    /// Plain single-robot trial
    Simple(SimpleTrial),
    /// Single-robot trial synchronized with a benchmarking box
    External(Box<ExternalTrial>),
    /// All present robots
    Fleet(FleetTrial),
}

impl Trial {
    /// Links the robot(s) and builds the trial kind the benchmark asks for.
    ///
    /// # Errors
    ///
    /// Single-robot kinds fail with [`TrialError::NoRobot`] when no robot is
    /// given, [`TrialError::TeamBusy`] when the team is already
    /// benchmarking, and [`TrialError::Channel`] when the channel cannot be
    /// opened.
    pub async fn connect(setup: TrialSetup<'_>, now: Instant) -> Result<Self, TrialError> {
        let TrialSetup {
            zone,
            event,
            robot,
            shared,
            factory,
            bus,
            on_end,
            inbound,
        } = setup;
        let kind = event.benchmark.kind;

        if kind == TrialKind::Fleet {
            let lifecycle = Lifecycle::new(zone, event, shared, Arc::clone(bus), on_end, now);
            let trial = FleetTrial::connect(lifecycle, shared, factory, bus, &inbound, now).await;
            return Ok(Self::Fleet(trial));
        }

        let external = match kind {
            TrialKind::External => Some(event.benchmark.external.clone().ok_or_else(|| {
                TrialError::InvalidState {
                    kind: kind.as_str(),
                    state: format!("benchmark {} has no benchmarking box settings", event.benchmark.code),
                }
            })?),
            _ => None,
        };
        let robot = robot.ok_or_else(|| TrialError::NoRobot {
            team: event.team.clone(),
        })?;

        let sink = InboundSink::new(0, inbound);
        let link = RobotLink::connect(shared, factory, &event, &robot, sink, now).await?;
        let lifecycle = Lifecycle::new(zone, event, shared, Arc::clone(bus), on_end, now);
        Ok(match external {
            Some(spec) => Self::External(Box::new(ExternalTrial::new(lifecycle, link, spec, now))),
            None => Self::Simple(SimpleTrial::new(lifecycle, link)),
        })
    }

    fn benchmark(&self) -> &dyn Benchmark {
        match self {
            Self::Simple(t) => t,
            Self::External(t) => &**t,
            Self::Fleet(t) => t,
        }
    }

    fn benchmark_mut(&mut self) -> &mut dyn Benchmark {
        match self {
            Self::Simple(t) => t,
            Self::External(t) => &mut **t,
            Self::Fleet(t) => t,
        }
    }

    /// Trial kind.
    #[must_use]
    pub const fn kind(&self) -> TrialKind {
        match self {
            Self::Simple(_) => TrialKind::Simple,
            Self::External(_) => TrialKind::External,
            Self::Fleet(_) => TrialKind::Fleet,
        }
    }

    /// Zone identifier.
    #[must_use]
    pub fn zone(&self) -> &str {
        self.benchmark().lifecycle().zone()
    }

    /// Whether the trial ended itself.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.benchmark().lifecycle().is_terminated()
    }

    /// Starts the trial.
    pub fn start(&mut self, now: Instant) {
        self.benchmark_mut().start(now);
    }

    /// Stops the trial, or terminates it if already stopped.
    pub fn stop(&mut self, now: Instant) {
        self.benchmark_mut().stop(now);
    }

    /// Records a score.
    pub fn score(&mut self, update: &ScoreUpdate) {
        self.benchmark_mut()
            .lifecycle_mut()
            .record_score(&update.group, &update.desc, update.value);
    }

    fn external_mut(&mut self, command: &str) -> Option<&mut ExternalTrial> {
        if !matches!(self, Self::External(_)) {
            warn!(zone = %self.zone(), command, "Ignored unexpected command");
            return None;
        }
        match self {
            Self::External(t) => Some(t),
            _ => None,
        }
    }

    /// Referee completed a manual operation.
    pub fn manual_operation_complete(&mut self, now: Instant) {
        if let Some(t) = self.external_mut("manual_operation_complete") {
            t.manual_operation_complete(now);
        }
    }

    /// Referee completed the switch input.
    pub fn omf_complete(&mut self, now: Instant) {
        if let Some(t) = self.external_mut("omf_complete") {
            t.omf_complete(now);
        }
    }

    /// Referee reported damaged switches.
    pub fn omf_damaged(&mut self, damaged: u8) {
        if let Some(t) = self.external_mut("omf_damaged") {
            t.omf_damaged(damaged);
        }
    }

    /// Referee toggled a switch.
    pub fn omf_button(&mut self, button: u8) {
        if let Some(t) = self.external_mut("omf_button") {
            t.omf_button(button);
        }
    }

    /// Handles inbound robot traffic. A protocol violation terminates the
    /// trial (or, in a fleet, the offending sub-trial).
    pub fn on_robot_message(&mut self, now: Instant, inbound: RobotInbound) {
        if self.is_terminated() {
            return;
        }
        let RobotInbound { member, message } = inbound;
        match message {
            Inbound::RobotState(state) => {
                let result = match self {
                    Self::Simple(t) => t.on_robot_state(now, &state),
                    Self::External(t) => t.on_robot_state(now, &state),
                    Self::Fleet(t) => {
                        t.on_robot_state(now, member, &state);
                        Ok(())
                    }
                };
                if let Err(error) = result {
                    error!(zone = %self.zone(), %error, "terminating trial");
                    self.benchmark_mut().terminate(now);
                }
            }
            Inbound::PeerBenchmarkState { origin } => match self {
                Self::Simple(t) => t.link().peer_detected(&origin),
                Self::External(t) => t.link().peer_detected(&origin),
                Self::Fleet(t) => t.peer_detected(member, &origin),
            },
        }
    }

    /// Bus topic of the benchmarking box, if this kind watches one.
    #[must_use]
    pub fn bmbox_topic(&self) -> Option<String> {
        match self {
            Self::External(t) => Some(t.bmbox_topic()),
            _ => None,
        }
    }

    /// Handles a value seen on [`bmbox_topic`](Self::bmbox_topic).
    pub fn on_bmbox_value(&mut self, now: Instant, value: &serde_json::Value) {
        if let Self::External(t) = self {
            t.on_bmbox_value(now, value);
        }
    }

    /// Pushes current state to the robot(s) and the bus.
    pub fn retransmit(&self) {
        if self.is_terminated() {
            return;
        }
        match self {
            Self::Simple(t) => t.retransmit(),
            Self::External(t) => t.retransmit(),
            Self::Fleet(t) => t.retransmit(),
        }
    }

    /// Fires due timeouts.
    pub fn poll_timers(&mut self, now: Instant) {
        match self {
            Self::Fleet(t) => t.poll_all(now),
            other => other.benchmark_mut().poll_timers(now),
        }
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has
    /// something to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            Self::Fleet(t) => t.next_deadline_all(),
            other => other.benchmark().next_deadline(),
        }
    }

    /// Operator status.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> StatusView {
        self.benchmark().snapshot(now)
    }

    /// Releases channels and claims, and closes the audit log.
    pub fn dispose(&mut self) {
        if !self.is_terminated() {
            self.benchmark_mut().stop_communication();
        }
        match self {
            Self::Fleet(t) => t.finish_all(),
            other => other.benchmark_mut().lifecycle_mut().finish(),
        }
    }
}
