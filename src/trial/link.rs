//! One robot's private channel as seen by a trial.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::TrialEvent;
use crate::display::DisplayText;
use crate::error::{TrialError, TransportError};
use crate::messages::{BenchmarkState, BenchmarkStateMessage, Pose2D, RobotState, WireTime};
use crate::observability::RunLog;
use crate::observability::metrics;
use crate::shared::SharedState;
use crate::timing::signed_difference;
use crate::transport::{ChannelFactory, InboundSink, RobotChannel};

use super::status::StatusView;

/// Logs the items of a repeated heartbeat field the first time each shows
/// up.
#[derive(Debug)]
struct RepeatedReceiver {
    topic: &'static str,
    last: Vec<String>,
}

impl RepeatedReceiver {
    const fn new(topic: &'static str) -> Self {
        Self {
            topic,
            last: Vec::new(),
        }
    }

    fn receive(&mut self, items: &[String], log: &mut RunLog, online: &mut DisplayText) {
        if items == self.last.as_slice() {
            return;
        }
        for item in items.iter().filter(|item| !self.last.contains(item)) {
            log.text(self.topic, item);
            online.push(&format!("{}: {item}", self.topic.trim_start_matches('/')));
        }
        self.last = items.to_vec();
    }
}

/// Private channel plus everything learnt from the robot's heartbeats.
#[derive(Debug)]
pub struct RobotLink {
    team: String,
    robot: String,
    benchmark_code: String,
    channel: Box<dyn RobotChannel>,
    shared: Arc<SharedState>,
    ack: WireTime,
    last_skew: TimeDelta,
    last_beacon: Instant,
    messages_saved: u32,
    notifications: RepeatedReceiver,
    activation_event: RepeatedReceiver,
    visitor: RepeatedReceiver,
    final_command: RepeatedReceiver,
    closed: bool,
}

impl RobotLink {
    /// Opens a private channel for `robot`, trying successive ports until
    /// one binds, then claims the team.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::TeamBusy`] if the team is already benchmarking
    /// and [`TrialError::Channel`] if the channel fails for a reason other
    /// than port contention.
    pub async fn connect(
        shared: &Arc<SharedState>,
        factory: &dyn ChannelFactory,
        event: &TrialEvent,
        robot: &str,
        sink: InboundSink,
        now: Instant,
    ) -> Result<Self, TrialError> {
        if event.password.is_empty() {
            return Err(TrialError::NoPassword {
                team: event.team.clone(),
            });
        }
        let mut channel = loop {
            let port = shared.next_private_port();
            match factory.open(port, &event.password, sink.clone()).await {
                Ok(channel) => break channel,
                Err(error @ TransportError::PortUnavailable { .. }) => {
                    error!(%error, team = %event.team, port, "Failed to create a private channel. Retrying on next port.");
                    metrics::record_channel_open_failure();
                }
                Err(error) => return Err(error.into()),
            }
        };

        if !shared.claim(&event.team, robot, channel.port()) {
            channel.close();
            return Err(TrialError::TeamBusy {
                team: event.team.clone(),
            });
        }
        debug!(team = %event.team, robot, port = channel.port(), "robot linked");

        Ok(Self {
            team: event.team.clone(),
            robot: robot.to_string(),
            benchmark_code: event.benchmark.code.clone(),
            channel,
            shared: Arc::clone(shared),
            ack: WireTime::default(),
            last_skew: TimeDelta::zero(),
            last_beacon: now,
            messages_saved: 0,
            notifications: RepeatedReceiver::new("/notification"),
            activation_event: RepeatedReceiver::new("/command"),
            visitor: RepeatedReceiver::new("/visitor"),
            final_command: RepeatedReceiver::new("/command"),
            closed: false,
        })
    }

    /// Team name.
    #[must_use]
    pub fn team(&self) -> &str {
        &self.team
    }

    /// Robot name.
    #[must_use]
    pub fn robot(&self) -> &str {
        &self.robot
    }

    /// Private channel port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.channel.port()
    }

    /// Messages the robot reports having saved.
    #[must_use]
    pub const fn messages_saved(&self) -> u32 {
        self.messages_saved
    }

    /// Robot clock minus referee clock at the last heartbeat.
    #[must_use]
    pub const fn last_skew(&self) -> TimeDelta {
        self.last_skew
    }

    /// Process state the link reports into.
    #[must_use]
    pub const fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Absorbs a heartbeat: presence, acknowledgement, repeated fields.
    pub fn receive(&mut self, now: Instant, message: &RobotState, log: &mut RunLog, online: &mut DisplayText) {
        self.last_beacon = now;
        self.last_skew = message.time.skew_from(Utc::now());
        debug!(
            team = %self.team,
            robot = %self.robot,
            state = ?message.robot_state,
            skew_ms = self.last_skew.num_milliseconds(),
            "robot state"
        );
        self.shared
            .record_heartbeat(&self.team, &self.robot, self.last_skew, now);
        metrics::record_heartbeat(true);

        self.messages_saved = message.messages_saved;
        self.ack = message.time;

        self.notifications.receive(&message.notifications, log, online);
        self.activation_event
            .receive(&message.activation_event, log, online);
        self.visitor.receive(&message.visitor, log, online);
        self.final_command.receive(&message.final_command, log, online);
    }

    /// Reports a benchmark state heard from another referee box.
    pub fn peer_detected(&self, origin: &str) {
        error!(
            team = %self.team,
            port = self.port(),
            origin,
            "Detected another RSBB transmitting in the private channel"
        );
        metrics::record_peer_controller();
    }

    /// Sends the referee state with the latest acknowledgement.
    pub fn transmit(&self, state: BenchmarkState, target_pose: Option<Pose2D>) {
        if self.closed {
            return;
        }
        self.channel.send(&BenchmarkStateMessage {
            benchmark_type: self.benchmark_code.clone(),
            benchmark_state: state,
            acknowledgement: self.ack,
            target_pose,
        });
    }

    /// Adds the saved-messages line.
    pub fn push_messages_saved(&self, view: &mut StatusView) {
        view.push_line(format!("Messages saved: {}", self.messages_saved));
    }

    /// Adds clock-skew and silence warnings when over threshold.
    pub fn push_warnings(&self, now: Instant, view: &mut StatusView) {
        let settings = self.shared.settings();
        let skew_limit = signed_difference(settings.skew_warning_threshold, std::time::Duration::ZERO);
        if self.last_skew.abs() > skew_limit {
            view.push_line(format!(
                "WARNING: Last clock skew above threshold: {:.3}",
                seconds(self.last_skew)
            ));
        }
        let silence = now.saturating_duration_since(self.last_beacon);
        if silence > settings.beacon_warning_threshold {
            view.push_line(format!(
                "WARNING: Last robot transmission received {:.1} seconds ago",
                silence.as_secs_f64()
            ));
        }
    }

    /// Closes the channel and releases the team claim. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let port = self.channel.port();
        self.channel.close();
        self.shared.release(&self.team, port);
        debug!(team = %self.team, port, "robot unlinked");
    }
}

impl Drop for RobotLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrialKind;
    use crate::messages::RobotStateCode;
    use crate::transport::MemoryNetwork;
    use crate::trial::lifecycle::tests::{descriptor, event, shared};
    use crate::observability::TrialIdentity;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn run_log() -> RunLog {
        RunLog::noop(
            TrialIdentity {
                team: "alpha".to_string(),
                round: 1,
                run: 1,
                benchmark: "TST".to_string(),
                run_uuid: Uuid::nil(),
            },
            100,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_past_busy_ports() {
        let shared = Arc::new(shared());
        let network = MemoryNetwork::new();
        let base = shared.settings().rsbb_port;
        network.block_port(base + 1);
        network.block_port(base + 2);
        let (tx, _rx) = mpsc::unbounded_channel();
        let event = event(descriptor(TrialKind::Simple, Duration::from_secs(60)));

        let link = RobotLink::connect(&shared, &network, &event, "r1", InboundSink::new(0, tx), Instant::now())
            .await
            .unwrap();
        assert_eq!(link.port(), base + 3);
        assert_eq!(shared.claim_of("alpha").unwrap().port, base + 3);
        assert_eq!(network.secret(base + 3).as_deref(), Some("secret"));
    }

    #[tokio::test(start_paused = true)]
    async fn team_without_password_is_refused_before_opening_a_port() {
        let shared = Arc::new(shared());
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut event = event(descriptor(TrialKind::Simple, Duration::from_secs(60)));
        event.password = String::new();

        let err = RobotLink::connect(&shared, &network, &event, "r1", InboundSink::new(0, tx), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TrialError::NoPassword { ref team } if team == &event.team), "{err}");
        assert!(network.open_ports().is_empty());
        assert!(!shared.is_benchmarking(&event.team));
    }

    #[tokio::test(start_paused = true)]
    async fn second_link_for_team_is_refused_and_closed() {
        let shared = Arc::new(shared());
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let event = event(descriptor(TrialKind::Simple, Duration::from_secs(60)));
        let now = Instant::now();

        let mut first = RobotLink::connect(&shared, &network, &event, "r1", InboundSink::new(0, tx.clone()), now)
            .await
            .unwrap();
        let err = RobotLink::connect(&shared, &network, &event, "r2", InboundSink::new(0, tx), now)
            .await
            .unwrap_err();
        assert!(matches!(err, TrialError::TeamBusy { .. }));
        assert_eq!(network.open_ports(), vec![first.port()]);

        first.close();
        assert!(!shared.is_benchmarking("alpha"));
        assert!(network.open_ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_updates_presence_ack_and_repeated_fields() {
        let shared = Arc::new(shared());
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let event = event(descriptor(TrialKind::Simple, Duration::from_secs(60)));
        let now = Instant::now();
        let mut link = RobotLink::connect(&shared, &network, &event, "r1", InboundSink::new(0, tx), now)
            .await
            .unwrap();
        let mut log = run_log();
        let mut online = DisplayText::new(10);

        let mut heartbeat = RobotState::heartbeat("alpha", "r1", RobotStateCode::Preparing);
        heartbeat.messages_saved = 12;
        heartbeat.notifications = vec!["hello".to_string()];
        link.receive(now, &heartbeat, &mut log, &mut online);
        link.receive(now, &heartbeat, &mut log, &mut online);

        assert_eq!(link.messages_saved(), 12);
        assert!(shared.robot_for("alpha", now).is_some());
        assert_eq!(online.last(10), vec!["notification: hello".to_string()]);

        link.transmit(BenchmarkState::Prepare, None);
        let sent = network.last_sent(link.port()).unwrap();
        assert_eq!(sent.acknowledgement, heartbeat.time);
        assert_eq!(sent.benchmark_type, "TST");
    }
}
