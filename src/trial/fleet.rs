//! Fleet trial: one plain sub-trial per present robot.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::error::TrialError;
use crate::messages::{BenchmarkState, RobotState};
use crate::shared::SharedState;
use crate::transport::{ChannelFactory, InboundSink, RobotInbound};

use super::lifecycle::{Benchmark, Lifecycle};
use super::link::RobotLink;
use super::simple::SimpleTrial;
use super::status::StatusView;

/// Every present idle robot at once.
#[derive(Debug)]
pub struct FleetTrial {
    lifecycle: Lifecycle,
    members: Vec<SimpleTrial>,
}

impl FleetTrial {
    /// Links every present robot whose team is not already benchmarking.
    ///
    /// Robots that cannot be linked are logged and skipped; the fleet trial
    /// itself never fails to build.
    pub async fn connect(
        lifecycle: Lifecycle,
        shared: &Arc<SharedState>,
        factory: &dyn ChannelFactory,
        bus: &Arc<dyn Bus>,
        tx: &mpsc::UnboundedSender<RobotInbound>,
        now: Instant,
    ) -> Self {
        let mut members = Vec::new();
        for presence in shared.active_robots(now) {
            let team = presence.team.as_str();
            if shared.is_benchmarking(team) {
                error!(zone = %lifecycle.zone, "Ignoring robot of team {team} because it is already executing a benchmark");
                continue;
            }
            let password = shared.password(team).unwrap_or_default();
            let event = lifecycle.event.for_team(team, password);
            let sink = InboundSink::new(members.len(), tx.clone());
            match RobotLink::connect(shared, factory, &event, &presence.robot, sink, now).await {
                Ok(link) => {
                    let zone = format!("{}/{team}", lifecycle.zone);
                    let member = Lifecycle::new(zone, event, shared, Arc::clone(bus), Box::new(|| {}), now);
                    members.push(SimpleTrial::new(member, link));
                }
                Err(TrialError::TeamBusy { team }) => {
                    warn!(zone = %lifecycle.zone, %team, "team claimed while the fleet was linking");
                }
                Err(TrialError::NoPassword { team }) => {
                    error!(zone = %lifecycle.zone, %team, "Ignoring robot of team without password");
                }
                Err(error) => {
                    error!(zone = %lifecycle.zone, team, %error, "cannot link robot");
                }
            }
        }
        info!(zone = %lifecycle.zone, robots = members.len(), "fleet linked");
        Self { lifecycle, members }
    }

    /// Sub-trials in link order.
    #[must_use]
    pub fn members(&self) -> &[SimpleTrial] {
        &self.members
    }

    /// Routes a heartbeat to its sub-trial. A sub-trial that violates the
    /// protocol is terminated on its own.
    pub fn on_robot_state(&mut self, now: Instant, member: usize, message: &RobotState) {
        let Some(trial) = self.members.get_mut(member) else {
            warn!(zone = %self.lifecycle.zone, member, "heartbeat for unknown fleet member");
            return;
        };
        if trial.lifecycle().is_terminated() {
            return;
        }
        if let Err(error) = trial.on_robot_state(now, message) {
            error!(zone = %trial.lifecycle().zone(), %error, "terminating fleet member");
            trial.terminate(now);
        }
    }

    /// Reports a conflicting referee box seen by a sub-trial.
    pub fn peer_detected(&self, member: usize, origin: &str) {
        if let Some(trial) = self.members.get(member) {
            trial.link().peer_detected(origin);
        }
    }

    /// Pushes every live sub-trial's state to its robot.
    pub fn retransmit(&self) {
        for trial in self.members.iter().filter(|t| !t.lifecycle().is_terminated()) {
            trial.retransmit();
        }
    }

    /// Fires due timeouts of the fleet and of every sub-trial.
    pub fn poll_all(&mut self, now: Instant) {
        self.poll_timers(now);
        for trial in &mut self.members {
            trial.poll_timers(now);
        }
    }

    /// Earliest deadline across the fleet and its sub-trials.
    #[must_use]
    pub fn next_deadline_all(&self) -> Option<Instant> {
        self.members
            .iter()
            .filter_map(|trial| trial.next_deadline())
            .chain(self.next_deadline())
            .min()
    }

    /// Writes the closing audit record of the fleet and every sub-trial.
    pub fn finish_all(&mut self) {
        self.lifecycle.finish();
        for trial in &mut self.members {
            trial.lifecycle_mut().finish();
        }
    }
}

impl Benchmark for FleetTrial {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn on_enter_exec(&mut self, now: Instant) {
        for trial in &mut self.members {
            trial.start(now);
        }
        self.lifecycle
            .set_state(now, BenchmarkState::WaitingResult, "Preparing and executing");
    }

    fn on_enter_post(&mut self, now: Instant) {
        for trial in &mut self.members {
            trial.stop(now);
        }
    }

    fn on_fill_status(&self, _now: Instant, view: &mut StatusView) {
        let (mut preparing, mut executing, mut stopped) = (0_usize, 0_usize, 0_usize);
        for trial in &self.members {
            match trial.lifecycle().state() {
                BenchmarkState::Stop => stopped += 1,
                BenchmarkState::Prepare | BenchmarkState::GoalTx => preparing += 1,
                BenchmarkState::WaitingResult => executing += 1,
            }
        }
        view.push_line(format!("Robots preparing: {preparing}"));
        view.push_line(format!("Robots executing: {executing}"));
        view.push_line(format!("Robots stopped: {stopped}"));
    }

    fn stop_communication(&mut self) {
        for trial in &mut self.members {
            trial.stop_communication();
        }
    }
}
