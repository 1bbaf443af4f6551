//! Plain single-robot trial.
//!
//! The robot already knows its task: as soon as it reports it is waiting for
//! a goal the trial moves straight to `WaitingResult`, and a transmitted
//! result ends it.

use tokio::time::Instant;
use tracing::warn;

use crate::bus::device_set_topic;
use crate::error::TrialError;
use crate::messages::{BenchmarkState, DeviceRequest, RobotState, RobotStateCode};

use super::lifecycle::{Benchmark, Lifecycle};
use super::link::RobotLink;
use super::status::StatusView;

/// One robot, no external device.
#[derive(Debug)]
pub struct SimpleTrial {
    lifecycle: Lifecycle,
    link: RobotLink,
}

impl SimpleTrial {
    /// Wraps an already linked robot.
    #[must_use]
    pub const fn new(lifecycle: Lifecycle, link: RobotLink) -> Self {
        Self { lifecycle, link }
    }

    /// The robot link.
    #[must_use]
    pub const fn link(&self) -> &RobotLink {
        &self.link
    }

    /// Handles a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::InvalidState`] if the trial is in `GoalTx`,
    /// which a plain trial never enters.
    pub fn on_robot_state(&mut self, now: Instant, message: &RobotState) -> Result<(), TrialError> {
        let lifecycle = &mut self.lifecycle;
        self.link
            .receive(now, message, &mut lifecycle.log, &mut lifecycle.online);
        if lifecycle.event.benchmark.device_control {
            self.forward_devices(message);
        }

        match (self.lifecycle.state, message.robot_state) {
            (BenchmarkState::Prepare, RobotStateCode::WaitingGoal) => {
                self.lifecycle.set_state(
                    now,
                    BenchmarkState::WaitingResult,
                    "Robot finished preparation, executing (no explicit goal)",
                );
            }
            (BenchmarkState::GoalTx, _) => {
                return Err(TrialError::InvalidState {
                    kind: "simple",
                    state: BenchmarkState::GoalTx.to_string(),
                });
            }
            (BenchmarkState::WaitingResult, RobotStateCode::Stop | RobotStateCode::Preparing) => {
                warn!(zone = %self.lifecycle.zone, state = ?message.robot_state, "robot regressed while executing");
                self.phase_exec(now, "Received wrong state from robot, retrying from prepare");
            }
            (BenchmarkState::WaitingResult, RobotStateCode::ResultTx) => {
                self.phase_post(now, "Benchmark completed by the robot");
            }
            _ => {}
        }
        Ok(())
    }

    fn forward_devices(&mut self, message: &RobotState) {
        let known = self.link.shared().devices();
        let DeviceRequest {
            switch_1,
            switch_2,
            switch_3,
            blinds,
            dimmer,
        } = message.devices;

        let switches = [
            ("switch_1", switch_1, known.switch_1),
            ("switch_2", switch_2, known.switch_2),
            ("switch_3", switch_3, known.switch_3),
        ];
        for (device, requested, current) in switches {
            if let Some(value) = requested.filter(|v| *v != current) {
                self.publish_device(device, serde_json::json!({ "data": value }), u8::from(value));
            }
        }
        let levels = [
            ("blinds", blinds, known.blinds),
            ("dimmer", dimmer, known.dimmer),
        ];
        for (device, requested, current) in levels {
            if let Some(value) = requested.filter(|v| *v != current) {
                self.publish_device(device, serde_json::json!({ "data": value }), value);
            }
        }

        if let Some(show) = message.tablet_display_map {
            if self.link.shared().set_tablet_display_map(show) {
                self.lifecycle
                    .log
                    .byte("/tablet/display_map", u8::from(show));
            }
        }
    }

    fn publish_device(&mut self, device: &str, payload: serde_json::Value, logged: u8) {
        self.lifecycle.bus.publish(&device_set_topic(device), payload);
        self.lifecycle.log.byte(&format!("/devices/{device}"), logged);
    }

    /// Pushes the current state to the robot.
    pub fn retransmit(&self) {
        self.link.transmit(self.lifecycle.state, None);
    }
}

impl Benchmark for SimpleTrial {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn on_fill_status(&self, now: Instant, view: &mut StatusView) {
        self.link.push_messages_saved(view);
        self.link.push_warnings(now, view);
    }

    fn stop_communication(&mut self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::{BenchmarkDescriptor, TrialKind};
    use crate::shared::SharedState;
    use crate::transport::{InboundSink, MemoryNetwork};
    use crate::trial::lifecycle::Phase;
    use crate::trial::lifecycle::tests::{descriptor, event, shared};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        trial: SimpleTrial,
        bus: Arc<MemoryBus>,
        network: MemoryNetwork,
        shared: Arc<SharedState>,
    }

    async fn fixture(benchmark: Arc<BenchmarkDescriptor>) -> Fixture {
        let shared = Arc::new(shared());
        let bus = Arc::new(MemoryBus::new());
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let event = event(benchmark);
        let now = Instant::now();
        let link = RobotLink::connect(&shared, &network, &event, "r1", InboundSink::new(0, tx), now)
            .await
            .unwrap();
        let lifecycle = Lifecycle::new("zone".to_string(), event, &shared, bus.clone(), Box::new(|| {}), now);
        Fixture {
            trial: SimpleTrial::new(lifecycle, link),
            bus,
            network,
            shared,
        }
    }

    fn heartbeat(state: RobotStateCode) -> RobotState {
        RobotState::heartbeat("alpha", "r1", state)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_completes_on_result() {
        let mut f = fixture(descriptor(TrialKind::Simple, Duration::from_secs(60))).await;
        let now = Instant::now();
        f.trial.start(now);
        f.trial
            .on_robot_state(now, &heartbeat(RobotStateCode::WaitingGoal))
            .unwrap();
        assert_eq!(f.trial.lifecycle().state(), BenchmarkState::WaitingResult);

        f.trial
            .on_robot_state(now, &heartbeat(RobotStateCode::ResultTx))
            .unwrap();
        assert_eq!(f.trial.lifecycle().phase(), Phase::Post);
        assert_eq!(f.trial.lifecycle().state_desc(), "Benchmark completed by the robot");
    }

    #[tokio::test(start_paused = true)]
    async fn regression_while_waiting_result_returns_to_prepare() {
        let mut f = fixture(descriptor(TrialKind::Simple, Duration::from_secs(60))).await;
        let now = Instant::now();
        f.trial.start(now);
        f.trial
            .on_robot_state(now, &heartbeat(RobotStateCode::WaitingGoal))
            .unwrap();
        f.trial
            .on_robot_state(now, &heartbeat(RobotStateCode::Preparing))
            .unwrap();
        assert_eq!(f.trial.lifecycle().phase(), Phase::Exec);
        assert_eq!(f.trial.lifecycle().state(), BenchmarkState::Prepare);
    }

    #[tokio::test(start_paused = true)]
    async fn goal_tx_is_a_protocol_violation() {
        let mut f = fixture(descriptor(TrialKind::Simple, Duration::from_secs(60))).await;
        let now = Instant::now();
        f.trial.start(now);
        f.trial.lifecycle.set_state(now, BenchmarkState::GoalTx, "forced");
        let err = f
            .trial
            .on_robot_state(now, &heartbeat(RobotStateCode::Executing))
            .unwrap_err();
        assert!(matches!(err, TrialError::InvalidState { kind: "simple", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn retransmit_carries_current_state() {
        let mut f = fixture(descriptor(TrialKind::Simple, Duration::from_secs(60))).await;
        f.trial.start(Instant::now());
        f.trial.retransmit();
        let port = f.trial.link().port();
        let sent = f.network.last_sent(port).unwrap();
        assert_eq!(sent.benchmark_state, BenchmarkState::Prepare);
        assert!(sent.target_pose.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn device_deltas_are_forwarded() {
        let mut benchmark = (*descriptor(TrialKind::Simple, Duration::from_secs(60))).clone();
        benchmark.device_control = true;
        let mut f = fixture(Arc::new(benchmark)).await;
        let now = Instant::now();

        let mut message = heartbeat(RobotStateCode::Stop);
        message.devices.switch_1 = Some(true);
        message.devices.switch_2 = Some(false);
        message.devices.dimmer = Some(50);
        message.tablet_display_map = Some(true);
        f.trial.on_robot_state(now, &message).unwrap();

        assert_eq!(
            f.bus.latest(&device_set_topic("switch_1")),
            Some(serde_json::json!({ "data": true }))
        );
        assert!(f.bus.latest(&device_set_topic("switch_2")).is_none());
        assert_eq!(
            f.bus.latest(&device_set_topic("dimmer")),
            Some(serde_json::json!({ "data": 50 }))
        );
        assert!(f.shared.tablet_display_map());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_releases_team() {
        let mut f = fixture(descriptor(TrialKind::Simple, Duration::from_secs(60))).await;
        assert!(f.shared.is_benchmarking("alpha"));
        f.trial.stop(Instant::now());
        assert!(f.trial.lifecycle().is_terminated());
        assert!(!f.shared.is_benchmarking("alpha"));
        assert!(f.network.open_ports().is_empty());
    }
}
