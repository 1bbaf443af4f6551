//! Trial synchronized with an external benchmarking box (BmBox).
//!
//! The referee box owns two retained bus topics, `client_state` (on behalf of
//! the robot) and `refbox_state`, and watches the box's `bmbox_state`. Local
//! state only moves through the transition rules below; the box's state is
//! never copied.
//!
//! Timeouts come in two tiers: each goal has its own budget, and every goal
//! draws from a session-wide budget. A goal that times out with session
//! budget left is skipped and the next one prepared; running out of session
//! budget ends the trial.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::bus::publish_typed;
use crate::config::{ExternalSpec, GoalKind};
use crate::error::TrialError;
use crate::messages::{
    BenchmarkState, BmBoxMessage, BmBoxState, ClientMessage, ClientState, Pose2D, RefBoxMessage, RefBoxState,
    RobotState, RobotStateCode,
};
use crate::observability::metrics::TimeoutTier;
use crate::timing::format_countdown;

use super::lifecycle::{Benchmark, Lifecycle, Phase};
use super::link::RobotLink;
use super::status::{OmfPanel, StatusView};

#[derive(Debug, Deserialize)]
struct ManipulationGoal {
    #[serde(default)]
    initial_state: Vec<i64>,
    #[serde(default)]
    switches: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct PerceptionResult<'a> {
    item_class: &'a str,
    item_instance: &'a str,
    x: f64,
    y: f64,
    theta: f64,
    execution_time: f64,
}

#[derive(Debug, Serialize)]
struct ManipulationResult {
    switches: Vec<i64>,
    execution_time: f64,
    damaged_switches: u8,
}

fn to_yaml<T: Serialize>(value: &T) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|error| {
        error!(%error, "cannot serialize goal result");
        String::new()
    })
}

/// One robot plus a benchmarking box.
#[derive(Debug)]
pub struct ExternalTrial {
    lifecycle: Lifecycle,
    link: RobotLink,
    spec: ExternalSpec,
    switch_offset: u32,

    refbox: RefBoxMessage,
    client: ClientMessage,
    bmbox: BmBoxMessage,

    waiting_for_omf_complete: bool,
    goal_initial_state: Vec<bool>,
    goal_switches: Vec<u32>,
    on_switches: BTreeSet<u32>,
    changed_switches: Vec<u32>,
    damaged_switches: u8,

    last_exec_start: Instant,
    exec_duration: Option<Duration>,

    total_timeout: Duration,
    last_timeout: bool,
    location_idx: usize,
}

impl ExternalTrial {
    /// Wraps an already linked robot.
    #[must_use]
    pub fn new(mut lifecycle: Lifecycle, link: RobotLink, spec: ExternalSpec, now: Instant) -> Self {
        if let Some(waypoints) = &spec.waypoints {
            lifecycle.log.text("/waypoints_loading", &waypoints.summary());
        }
        let total_timeout = lifecycle.event.benchmark.total_timeout;
        let switch_offset = link.shared().settings().switch_ids_bmbox_to_right;
        Self {
            lifecycle,
            link,
            spec,
            switch_offset,
            refbox: RefBoxMessage::default(),
            client: ClientMessage::default(),
            bmbox: BmBoxMessage::default(),
            waiting_for_omf_complete: false,
            goal_initial_state: Vec::new(),
            goal_switches: Vec::new(),
            on_switches: BTreeSet::new(),
            changed_switches: Vec::new(),
            damaged_switches: 0,
            last_exec_start: now,
            exec_duration: None,
            total_timeout,
            last_timeout: false,
            location_idx: 0,
        }
    }

    /// The robot link.
    #[must_use]
    pub const fn link(&self) -> &RobotLink {
        &self.link
    }

    /// Topic the benchmarking box publishes its state on.
    #[must_use]
    pub fn bmbox_topic(&self) -> String {
        format!("{}bmbox_state", self.spec.bmbox_prefix)
    }

    /// Topic the client state is published on.
    #[must_use]
    pub fn client_topic(&self) -> String {
        format!("{}client_state", self.spec.bmbox_prefix)
    }

    /// Topic the referee state is published on.
    #[must_use]
    pub fn refbox_topic(&self) -> String {
        format!("{}refbox_state", self.spec.bmbox_prefix)
    }

    /// Last referee state published.
    #[must_use]
    pub const fn refbox(&self) -> &RefBoxMessage {
        &self.refbox
    }

    /// Last client state published.
    #[must_use]
    pub const fn client(&self) -> &ClientMessage {
        &self.client
    }

    /// Index of the current navigation waypoint.
    #[must_use]
    pub const fn location_idx(&self) -> usize {
        self.location_idx
    }

    /// Session budget left at the start of the current goal.
    #[must_use]
    pub const fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    fn waypoint_count(&self) -> usize {
        self.spec.waypoints.as_ref().map_or(0, |w| w.points.len())
    }

    fn target_pose(&self) -> Option<Pose2D> {
        if self.spec.goal != GoalKind::Navigation || self.lifecycle.state != BenchmarkState::GoalTx {
            return None;
        }
        self.spec
            .waypoints
            .as_ref()
            .and_then(|w| w.points.get(self.location_idx).copied())
    }

    // ------------------------------------------------------------------
    // Published states
    // ------------------------------------------------------------------

    fn set_client(&mut self, state: ClientState, payload: &str) {
        if state == self.client.state {
            return;
        }
        self.client = ClientMessage {
            state,
            payload: payload.to_string(),
        };
        publish_typed(self.lifecycle.bus.as_ref(), &self.client_topic(), &self.client);
        self.lifecycle.log.byte("/client_state", state as u8);
        self.lifecycle.log.text("/client_state_payload", payload);
    }

    fn set_refbox(&mut self, state: RefBoxState, payload: &str) {
        if state == self.refbox.state {
            return;
        }
        self.refbox = RefBoxMessage {
            state,
            payload: payload.to_string(),
        };
        publish_typed(self.lifecycle.bus.as_ref(), &self.refbox_topic(), &self.refbox);
        self.lifecycle.log.byte("/refbox_state", state as u8);
        self.lifecycle.log.text("/refbox_state_payload", payload);
    }

    /// Pushes the state to the robot and republishes the referee-owned
    /// topics.
    pub fn retransmit(&self) {
        self.link.transmit(self.lifecycle.state, self.target_pose());
        let bus = self.lifecycle.bus.as_ref();
        if self.client.state != ClientState::Start {
            publish_typed(bus, &self.client_topic(), &self.client);
        }
        if self.refbox.state != RefBoxState::Start {
            publish_typed(bus, &self.refbox_topic(), &self.refbox);
        }
    }

    // ------------------------------------------------------------------
    // Benchmarking box
    // ------------------------------------------------------------------

    /// Handles a value seen on the box's state topic. Malformed values and
    /// repeats of the current state are ignored.
    pub fn on_bmbox_value(&mut self, now: Instant, value: &serde_json::Value) {
        let message = match serde_json::from_value::<BmBoxMessage>(value.clone()) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, zone = %self.lifecycle.zone, "ignoring malformed bmbox state");
                return;
            }
        };
        if message.state == self.bmbox.state {
            return;
        }
        debug!(zone = %self.lifecycle.zone, state = ?message.state, "bmbox state");
        self.bmbox = message;
        if self.lifecycle.phase == Phase::Exec {
            self.check_bmbox_transition(now);
        }
    }

    fn check_bmbox_transition(&mut self, now: Instant) {
        let bm = self.bmbox.state;
        match self.lifecycle.state {
            BenchmarkState::Stop => {}
            BenchmarkState::Prepare => {
                if bm == BmBoxState::TransmittingScore
                    && self.spec.goal == GoalKind::Navigation
                    && self.location_idx >= self.waypoint_count()
                {
                    self.set_client(ClientState::End, "");
                    self.set_refbox(RefBoxState::ReceivedScore, "");
                    let desc = format!("Benchmark complete! Received score from BmBox: {}", self.bmbox.payload);
                    self.phase_post(now, &desc);
                    return;
                }

                if self.refbox.state == RefBoxState::Ready
                    && self.client.state == ClientState::WaitingGoal
                    && bm == BmBoxState::WaitingManualOperation
                {
                    self.set_refbox(RefBoxState::ExecutingManualOperation, "");
                    self.lifecycle.manual_operation.clone_from(&self.bmbox.payload);
                    self.lifecycle.timer.stop_pause(now);
                }

                if matches!(self.refbox.state, RefBoxState::Ready | RefBoxState::ExecutingGoal)
                    && self.client.state == ClientState::WaitingGoal
                {
                    match bm {
                        BmBoxState::TransmittingGoal => {
                            self.last_exec_start = now;
                            self.exec_duration = None;
                            self.lifecycle.timer.resume(now);
                            self.load_goal();
                            let payload = self.bmbox.payload.clone();
                            self.lifecycle.log.text("/bmbox/goal", &payload);
                            self.lifecycle.set_state(
                                now,
                                BenchmarkState::GoalTx,
                                "Robot finished preparation, received goal from BmBox, starting execution",
                            );
                        }
                        BmBoxState::WaitingResult => {
                            self.last_exec_start = now;
                            self.exec_duration = None;
                            self.lifecycle.timer.resume(now);
                            self.lifecycle.set_state(
                                now,
                                BenchmarkState::GoalTx,
                                "Robot finished preparation, no goal from BmBox, starting execution",
                            );
                            self.set_refbox(RefBoxState::ExecutingGoal, "");
                            self.set_client(ClientState::ExecutingGoal, "");
                        }
                        _ => {}
                    }
                }
            }
            BenchmarkState::GoalTx => {
                if self.refbox.state == RefBoxState::ExecutingGoal
                    && self.client.state == ClientState::ExecutingGoal
                    && bm == BmBoxState::WaitingResult
                {
                    self.lifecycle.set_state(
                        now,
                        BenchmarkState::WaitingResult,
                        "Robot received goal, waiting for result",
                    );
                }
            }
            BenchmarkState::WaitingResult => {
                if self.refbox.state == RefBoxState::Ready && self.client.state == ClientState::CompletedGoal {
                    match bm {
                        BmBoxState::TransmittingScore => {
                            let payload = self.bmbox.payload.clone();
                            self.lifecycle.log.text("/bmbox/score", &payload);
                            self.set_refbox(RefBoxState::ReceivedScore, "");
                            self.phase_post(now, &format!("Benchmark complete! Received score from BmBox: {payload}"));
                        }
                        BmBoxState::WaitingManualOperation | BmBoxState::TransmittingGoal => {
                            self.phase_exec(now, "Robot preparing for new goal!");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn load_goal(&mut self) {
        self.goal_initial_state.clear();
        self.goal_switches.clear();
        let goals: Vec<ManipulationGoal> = match serde_yaml::from_str(&self.bmbox.payload) {
            Ok(goals) => goals,
            Err(error) => {
                debug!(%error, zone = %self.lifecycle.zone, "goal payload carries no switch layout");
                return;
            }
        };
        let Some(goal) = goals.into_iter().next() else {
            return;
        };
        self.goal_initial_state = goal.initial_state.iter().map(|v| *v != 0).collect();
        for (idx, on) in (1_u32..).zip(&self.goal_initial_state) {
            if *on {
                self.on_switches.insert(idx);
            }
        }
        self.goal_switches = goal
            .switches
            .iter()
            .map(|id| id.saturating_add(self.switch_offset))
            .collect();
    }

    // ------------------------------------------------------------------
    // Robot
    // ------------------------------------------------------------------

    /// Handles a heartbeat.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches the other kinds.
    pub fn on_robot_state(&mut self, now: Instant, message: &RobotState) -> Result<(), TrialError> {
        let lifecycle = &mut self.lifecycle;
        self.link
            .receive(now, message, &mut lifecycle.log, &mut lifecycle.online);

        match self.lifecycle.state {
            BenchmarkState::Stop => {}
            BenchmarkState::Prepare => {
                if self.client.state != ClientState::WaitingGoal && message.robot_state == RobotStateCode::WaitingGoal {
                    self.set_refbox(RefBoxState::Ready, "");
                    self.set_client(ClientState::WaitingGoal, "");
                    self.lifecycle.set_desc(now, "Robot is waiting for goal.");
                    self.check_bmbox_transition(now);
                }
            }
            BenchmarkState::GoalTx => {
                if self.client.state == ClientState::WaitingGoal && message.robot_state == RobotStateCode::Executing {
                    self.set_refbox(RefBoxState::ExecutingGoal, "");
                    self.set_client(ClientState::ExecutingGoal, "");
                    self.lifecycle.set_desc(now, "Robot is executing.");
                    self.check_bmbox_transition(now);
                }
            }
            BenchmarkState::WaitingResult => {
                if self.client.state == ClientState::ExecutingGoal && message.robot_state == RobotStateCode::ResultTx {
                    self.on_result(now, message);
                }
            }
        }
        Ok(())
    }

    fn on_result(&mut self, now: Instant, message: &RobotState) {
        if self.exec_duration.is_none() {
            self.exec_duration = Some(now.saturating_duration_since(self.last_exec_start));
            if self.spec.goal == GoalKind::ObjectManipulation {
                self.lifecycle.set_desc(
                    now,
                    "Robot finished executing. Waiting for switches input from referee.",
                );
                self.lifecycle.timer.stop_pause(now);
            }
        }
        let execution_time = self.exec_duration.unwrap_or_default().as_secs_f64();

        match self.spec.goal {
            GoalKind::ObjectPerception => {
                let object = message.object.clone().unwrap_or_default();
                let result = to_yaml(&PerceptionResult {
                    item_class: &object.class,
                    item_instance: &object.name,
                    x: object.pose.x,
                    y: object.pose.y,
                    theta: object.pose.theta,
                    execution_time,
                });
                self.lifecycle.log.text("/opf_result", &result);
                self.set_refbox(RefBoxState::Ready, "");
                self.set_client(ClientState::CompletedGoal, &result);
                self.check_bmbox_transition(now);
            }
            GoalKind::ObjectManipulation => {
                self.waiting_for_omf_complete = true;
            }
            GoalKind::Navigation => {
                let count = self.waypoint_count();
                if self.location_idx < count {
                    self.location_idx += 1;
                    if self.location_idx == count {
                        self.set_refbox(RefBoxState::ReceivedScore, "");
                        self.set_client(ClientState::CompletedGoal, "");
                        let desc = format!("Benchmark complete! Received score from BmBox: {}", self.bmbox.payload);
                        self.phase_post(now, &desc);
                        return;
                    }
                }
                self.set_refbox(RefBoxState::Ready, "");
                self.set_client(ClientState::CompletedGoal, "");
                self.check_bmbox_transition(now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Referee commands
    // ------------------------------------------------------------------

    /// Referee finished the manual operation the box asked for.
    pub fn manual_operation_complete(&mut self, now: Instant) {
        self.lifecycle.manual_operation.clear();
        if self.lifecycle.state == BenchmarkState::Prepare
            && self.refbox.state == RefBoxState::ExecutingManualOperation
            && self.client.state == ClientState::WaitingGoal
        {
            self.set_refbox(RefBoxState::ExecutingGoal, "");
            self.check_bmbox_transition(now);
        }
    }

    /// Referee finished recording switches; completes the goal with the
    /// toggled switches as result.
    pub fn omf_complete(&mut self, now: Instant) {
        if !self.waiting_for_omf_complete {
            return;
        }
        self.waiting_for_omf_complete = false;
        let execution_time = self
            .exec_duration
            .get_or_insert_with(|| now.saturating_duration_since(self.last_exec_start))
            .as_secs_f64();

        let offset = i64::from(self.switch_offset);
        let result = to_yaml(&ManipulationResult {
            switches: self
                .changed_switches
                .iter()
                .map(|id| i64::from(*id) - offset)
                .collect(),
            execution_time,
            damaged_switches: self.damaged_switches,
        });
        self.lifecycle.log.text("/omf_complete", &result);

        self.set_refbox(RefBoxState::Ready, "");
        self.set_client(ClientState::CompletedGoal, &result);
        self.check_bmbox_transition(now);

        self.goal_initial_state.clear();
        self.goal_switches.clear();
        self.on_switches.clear();
        self.changed_switches.clear();
        self.damaged_switches = 0;

        self.lifecycle.timer.resume(now);
    }

    /// Records the number of damaged switches.
    pub fn omf_damaged(&mut self, damaged: u8) {
        self.damaged_switches = damaged;
        self.lifecycle.log.byte("/omf_damaged", damaged);
    }

    /// Toggles one switch.
    pub fn omf_button(&mut self, button: u8) {
        let id = u32::from(button);
        self.changed_switches.push(id);
        if !self.on_switches.remove(&id) {
            self.on_switches.insert(id);
        }
        self.lifecycle.log.byte("/omf_button", button);
    }
}

impl Benchmark for ExternalTrial {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn on_enter_exec(&mut self, now: Instant) {
        self.waiting_for_omf_complete = false;

        let per_goal = self.lifecycle.event.benchmark.timeout;
        let timer = &mut self.lifecycle.timer;
        self.total_timeout = self.total_timeout.saturating_sub(timer.elapsed(now));
        if per_goal < self.total_timeout {
            timer.start_reset(now, Some(per_goal));
            self.last_timeout = false;
        } else {
            timer.start_reset(now, Some(self.total_timeout));
            self.last_timeout = true;
        }
    }

    fn on_enter_post(&mut self, now: Instant) {
        if self.refbox.state == RefBoxState::ReceivedScore {
            return;
        }

        if self.lifecycle.timed_out && !self.last_timeout {
            if self.spec.goal == GoalKind::Navigation {
                if self.location_idx < self.waypoint_count() {
                    self.location_idx += 1;
                    self.set_client(ClientState::CompletedGoal, "reason: timeout");
                }
                self.lifecycle.set_state(
                    now,
                    BenchmarkState::WaitingResult,
                    "Robot received goal, waiting for result",
                );
            } else {
                self.set_refbox(RefBoxState::Ready, "");
                self.set_client(ClientState::CompletedGoal, "reason: timeout");
            }
            self.phase_exec(now, "Robot timedout a goal, trying the next one...");
        } else if self.lifecycle.timed_out {
            self.lifecycle.set_state(now, BenchmarkState::Stop, "Global timeout.");
            self.set_refbox(RefBoxState::End, "reason: stop");
            self.set_client(ClientState::End, "");
        } else {
            self.set_refbox(RefBoxState::End, "reason: stop");
            self.set_client(ClientState::End, "");
        }
    }

    fn on_fill_status(&self, now: Instant, view: &mut StatusView) {
        self.link.push_messages_saved(view);
        let phase = self.lifecycle.phase;
        if phase == Phase::Exec {
            let left = self.lifecycle.timer.until_timeout_for(now, self.total_timeout);
            view.push_line(format!("Benchmark timeout: {}", format_countdown(left)));
        }

        if self.lifecycle.bus.publisher_count(&self.bmbox_topic()) == 0 {
            view.push_line("NOT CONNECTED TO BmBox!!!");
        } else if phase == Phase::Post {
            view.push_line("You may need to restart BmBox if you are to press start again");
        }

        if self.spec.goal == GoalKind::Navigation {
            let count = self.waypoint_count();
            view.push_line(format!("Waypoint: {}/{count}", (self.location_idx + 1).min(count)));
        }

        if self.spec.goal == GoalKind::ObjectManipulation
            && !self.goal_initial_state.is_empty()
            && phase == Phase::Exec
        {
            view.omf = Some(OmfPanel {
                switches: self.on_switches.iter().copied().collect(),
                damaged: u32::from(self.damaged_switches),
                complete: self.waiting_for_omf_complete,
            });
        }
        self.link.push_warnings(now, view);
    }

    fn stop_communication(&mut self) {
        self.link.close();
    }

    fn timeout_tier(&self) -> TimeoutTier {
        if self.last_timeout {
            TimeoutTier::Total
        } else {
            TimeoutTier::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use crate::config::{BenchmarkDescriptor, TrialKind};
    use crate::shared::SharedState;
    use crate::transport::{InboundSink, MemoryNetwork};
    use crate::trial::lifecycle::tests::{descriptor, event, shared};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Fixture {
        trial: ExternalTrial,
        bus: Arc<MemoryBus>,
        network: MemoryNetwork,
        _shared: Arc<SharedState>,
    }

    fn benchmark(goal: GoalKind) -> Arc<BenchmarkDescriptor> {
        let mut benchmark = (*descriptor(TrialKind::External, Duration::from_secs(60))).clone();
        benchmark.total_timeout = Duration::from_secs(300);
        benchmark.external = Some(ExternalSpec {
            goal,
            bmbox_prefix: "/fbm/".to_string(),
            waypoints: None,
        });
        Arc::new(benchmark)
    }

    async fn fixture(benchmark: Arc<BenchmarkDescriptor>) -> Fixture {
        let shared = Arc::new(shared());
        let bus = Arc::new(MemoryBus::new());
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let event = event(benchmark);
        let spec = event.benchmark.external.clone().unwrap();
        let now = Instant::now();
        let link = RobotLink::connect(&shared, &network, &event, "r1", InboundSink::new(0, tx), now)
            .await
            .unwrap();
        let lifecycle = Lifecycle::new("zone".to_string(), event, &shared, bus.clone(), Box::new(|| {}), now);
        Fixture {
            trial: ExternalTrial::new(lifecycle, link, spec, now),
            bus,
            network,
            _shared: shared,
        }
    }

    fn robot(trial: &mut ExternalTrial, now: Instant, state: RobotStateCode) {
        trial
            .on_robot_state(now, &RobotState::heartbeat("alpha", "r1", state))
            .unwrap();
    }

    fn bmbox(trial: &mut ExternalTrial, now: Instant, state: BmBoxState, payload: &str) {
        trial.on_bmbox_value(now, &json!({ "state": state, "payload": payload }));
    }

    #[tokio::test(start_paused = true)]
    async fn perception_goal_runs_to_score() {
        let mut f = fixture(benchmark(GoalKind::ObjectPerception)).await;
        let t = &mut f.trial;
        let now = Instant::now();
        t.start(now);

        robot(t, now, RobotStateCode::WaitingGoal);
        assert_eq!(t.refbox().state, RefBoxState::Ready);
        assert_eq!(t.client().state, ClientState::WaitingGoal);
        assert_eq!(t.lifecycle().state_desc(), "Robot is waiting for goal.");

        bmbox(t, now, BmBoxState::TransmittingGoal, "- {}");
        assert_eq!(t.lifecycle().state(), BenchmarkState::GoalTx);

        robot(t, now, RobotStateCode::Executing);
        assert_eq!(t.client().state, ClientState::ExecutingGoal);
        bmbox(t, now, BmBoxState::WaitingResult, "");
        assert_eq!(t.lifecycle().state(), BenchmarkState::WaitingResult);

        let mut result = RobotState::heartbeat("alpha", "r1", RobotStateCode::ResultTx);
        result.object = Some(crate::messages::PerceivedObject {
            class: "cup".to_string(),
            name: "red_cup".to_string(),
            pose: Pose2D { x: 1.0, y: 2.0, theta: 0.5 },
        });
        t.on_robot_state(now + Duration::from_secs(3), &result).unwrap();
        assert_eq!(t.client().state, ClientState::CompletedGoal);
        assert!(t.client().payload.contains("item_class: cup"));
        assert!(t.client().payload.contains("execution_time: 3"));

        bmbox(t, now, BmBoxState::TransmittingScore, "score: 10");
        assert_eq!(t.lifecycle().phase(), Phase::Post);
        assert_eq!(t.refbox().state, RefBoxState::ReceivedScore);
        assert_eq!(
            t.lifecycle().state_desc(),
            "Benchmark complete! Received score from BmBox: score: 10"
        );
        assert_eq!(
            f.bus.latest("/fbm/refbox_state").unwrap()["state"],
            "RECEIVED_SCORE"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_operation_pauses_the_timer() {
        let mut f = fixture(benchmark(GoalKind::ObjectPerception)).await;
        let t = &mut f.trial;
        let start = Instant::now();
        t.start(start);
        robot(t, start, RobotStateCode::WaitingGoal);

        bmbox(t, start, BmBoxState::WaitingManualOperation, "place the cup");
        assert_eq!(t.refbox().state, RefBoxState::ExecutingManualOperation);
        assert!(t.next_deadline().is_none());
        assert_eq!(t.snapshot(start).manual_operation, "place the cup");

        let later = start + Duration::from_secs(30);
        t.manual_operation_complete(later);
        assert_eq!(t.refbox().state, RefBoxState::ExecutingGoal);
        assert!(t.snapshot(later).manual_operation.is_empty());

        bmbox(t, later, BmBoxState::TransmittingGoal, "- {}");
        assert_eq!(t.lifecycle().state(), BenchmarkState::GoalTx);
        assert_eq!(t.next_deadline(), Some(later + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_and_malformed_bmbox_values_are_ignored() {
        let mut f = fixture(benchmark(GoalKind::ObjectPerception)).await;
        let t = &mut f.trial;
        let now = Instant::now();
        t.start(now);
        robot(t, now, RobotStateCode::WaitingGoal);

        t.on_bmbox_value(now, &json!({ "state": "NOT_A_STATE" }));
        t.on_bmbox_value(now, &json!(42));
        assert_eq!(t.lifecycle().state(), BenchmarkState::Prepare);

        bmbox(t, now, BmBoxState::Ready, "");
        bmbox(t, now, BmBoxState::Ready, "other");
        assert_eq!(t.lifecycle().state(), BenchmarkState::Prepare);
    }

    #[tokio::test(start_paused = true)]
    async fn goal_less_box_executes_immediately() {
        let mut f = fixture(benchmark(GoalKind::ObjectPerception)).await;
        let t = &mut f.trial;
        let now = Instant::now();
        t.start(now);
        robot(t, now, RobotStateCode::WaitingGoal);
        bmbox(t, now, BmBoxState::WaitingResult, "");
        assert_eq!(t.lifecycle().state(), BenchmarkState::GoalTx);
        assert_eq!(t.refbox().state, RefBoxState::ExecutingGoal);
        assert_eq!(t.client().state, ClientState::ExecutingGoal);
    }

    #[tokio::test(start_paused = true)]
    async fn manipulation_waits_for_referee_switches() {
        let mut f = fixture(benchmark(GoalKind::ObjectManipulation)).await;
        let _bmbox_online = f.bus.advertise("/fbm/bmbox_state");
        let t = &mut f.trial;
        let now = Instant::now();
        t.start(now);
        robot(t, now, RobotStateCode::WaitingGoal);
        bmbox(t, now, BmBoxState::TransmittingGoal, "- initial_state: [1, 0, 1]\n  switches: [2]\n");
        robot(t, now, RobotStateCode::Executing);
        bmbox(t, now, BmBoxState::WaitingResult, "");

        let panel = t.snapshot(now).omf.unwrap();
        assert_eq!(panel.switches, vec![1, 3]);
        assert!(!panel.complete);

        let done = now + Duration::from_secs(5);
        robot(t, done, RobotStateCode::ResultTx);
        assert_eq!(
            t.lifecycle().state_desc(),
            "Robot finished executing. Waiting for switches input from referee."
        );
        assert!(t.next_deadline().is_none());
        assert!(t.snapshot(done).omf.unwrap().complete);

        t.omf_button(1);
        t.omf_button(2);
        t.omf_damaged(1);
        let panel = t.snapshot(done).omf.unwrap();
        assert_eq!(panel.switches, vec![2, 3]);
        assert_eq!(panel.damaged, 1);

        t.omf_complete(done + Duration::from_secs(20));
        assert_eq!(t.client().state, ClientState::CompletedGoal);
        assert!(t.client().payload.contains("damaged_switches: 1"));
        assert!(t.client().payload.contains("execution_time: 5"));
        assert!(t.next_deadline().is_some());
        assert!(t.snapshot(done).omf.is_none());
        assert!(!t.snapshot(done).state.contains("NOT CONNECTED"));
    }

    #[tokio::test(start_paused = true)]
    async fn referee_stop_ends_the_handshake() {
        let mut f = fixture(benchmark(GoalKind::ObjectPerception)).await;
        let t = &mut f.trial;
        let now = Instant::now();
        t.start(now);
        robot(t, now, RobotStateCode::WaitingGoal);
        t.stop(now);
        assert_eq!(t.lifecycle().phase(), Phase::Post);
        assert_eq!(t.lifecycle().state_desc(), "Benchmark Stopped by referee");
        assert_eq!(t.refbox().state, RefBoxState::End);
        assert_eq!(t.client().state, ClientState::End);
        assert!(t.snapshot(now).state.contains("NOT CONNECTED TO BmBox!!!"));
    }

    #[tokio::test(start_paused = true)]
    async fn retransmit_republishes_owned_topics() {
        let mut f = fixture(benchmark(GoalKind::ObjectPerception)).await;
        f.trial.retransmit();
        assert!(f.bus.latest("/fbm/client_state").is_none());

        let now = Instant::now();
        f.trial.start(now);
        robot(&mut f.trial, now, RobotStateCode::WaitingGoal);
        f.bus.publish("/fbm/client_state", json!(null));
        f.trial.retransmit();
        assert_eq!(f.bus.latest("/fbm/client_state").unwrap()["state"], "WAITING_GOAL");
        let sent = f.network.last_sent(f.trial.link().port()).unwrap();
        assert_eq!(sent.benchmark_state, BenchmarkState::Prepare);
    }
}
