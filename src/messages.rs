//! Wire messages exchanged with robots and the benchmarking box.
//!
//! Robot-facing messages travel over the private channel (see
//! [`crate::transport`]); the benchmarking-box messages travel over the
//! [`crate::bus`]. Everything is plain serde so both transports can carry it
//! as JSON.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Time
// ============================================================================

/// Wall-clock timestamp as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct WireTime {
    /// Seconds since the Unix epoch
    pub sec: i64,
    /// Nanoseconds within the second
    pub nsec: u32,
}

impl WireTime {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Converts from a chrono timestamp.
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            sec: at.timestamp(),
            nsec: at.timestamp_subsec_nanos(),
        }
    }

    /// Converts to a chrono timestamp; `None` when out of range.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.sec, self.nsec)
    }

    /// Offset of this timestamp from `reference`; positive when ahead.
    #[must_use]
    pub fn skew_from(self, reference: DateTime<Utc>) -> TimeDelta {
        self.to_datetime()
            .map_or(TimeDelta::zero(), |at| at - reference)
    }
}

/// Serializes a signed [`TimeDelta`] as fractional seconds.
pub mod delta_secs {
    use chrono::TimeDelta;
    use serde::Serializer;

    /// Serde `serialize_with` target.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    #[allow(clippy::cast_precision_loss)]
    pub fn serialize<S: Serializer>(delta: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = delta.num_milliseconds() as f64 / 1000.0;
        serializer.serialize_f64(secs)
    }
}

// ============================================================================
// Robot channel
// ============================================================================

/// State a robot reports about itself in every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RobotStateCode {
    /// Robot is idle
    Stop,
    /// Robot is preparing for the task
    Preparing,
    /// Robot is ready and waiting for a goal
    WaitingGoal,
    /// Robot is executing the goal
    Executing,
    /// Robot is transmitting its result
    ResultTx,
}

/// Fine-grained trial progress reported back to the robot and operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenchmarkState {
    /// Not running
    #[default]
    Stop,
    /// Robot should prepare
    Prepare,
    /// A goal is being transmitted to the robot
    GoalTx,
    /// Waiting for the robot's result
    WaitingResult,
}

impl BenchmarkState {
    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Prepare => "PREPARE",
            Self::GoalTx => "GOAL_TX",
            Self::WaitingResult => "WAITING_RESULT",
        }
    }
}

impl std::fmt::Display for BenchmarkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planar pose.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2D {
    /// X coordinate in metres
    pub x: f64,
    /// Y coordinate in metres
    pub y: f64,
    /// Heading in radians
    pub theta: f64,
}

/// Device changes a robot requests from the smart environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRequest {
    /// Requested state of switch 1
    pub switch_1: Option<bool>,
    /// Requested state of switch 2
    pub switch_2: Option<bool>,
    /// Requested state of switch 3
    pub switch_3: Option<bool>,
    /// Requested blinds position (percent)
    pub blinds: Option<u8>,
    /// Requested dimmer level (percent)
    pub dimmer: Option<u8>,
}

/// Object recognised by the robot in a perception benchmark.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceivedObject {
    /// Object class
    pub class: String,
    /// Object instance name
    pub name: String,
    /// Estimated pose
    pub pose: Pose2D,
}

/// Heartbeat a robot sends on its private channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    /// Robot wall-clock time when the message was sent
    pub time: WireTime,
    /// Team name
    pub team_name: String,
    /// Robot name
    pub robot_name: String,
    /// Robot-side state
    pub robot_state: RobotStateCode,
    /// Number of messages the robot has saved to its own log
    #[serde(default)]
    pub messages_saved: u32,
    /// Notifications the robot is currently showing
    #[serde(default)]
    pub notifications: Vec<String>,
    /// Activation events recognised
    #[serde(default)]
    pub activation_event: Vec<String>,
    /// Visitors recognised
    #[serde(default)]
    pub visitor: Vec<String>,
    /// Final commands understood
    #[serde(default)]
    pub final_command: Vec<String>,
    /// Smart-environment device changes requested
    #[serde(default)]
    pub devices: DeviceRequest,
    /// Requested tablet map display
    #[serde(default)]
    pub tablet_display_map: Option<bool>,
    /// Perception result, if any
    #[serde(default)]
    pub object: Option<PerceivedObject>,
}

impl RobotState {
    /// Bare heartbeat stamped with the current time.
    #[must_use]
    pub fn heartbeat(team: &str, robot: &str, state: RobotStateCode) -> Self {
        Self {
            time: WireTime::now(),
            team_name: team.to_string(),
            robot_name: robot.to_string(),
            robot_state: state,
            messages_saved: 0,
            notifications: Vec::new(),
            activation_event: Vec::new(),
            visitor: Vec::new(),
            final_command: Vec::new(),
            devices: DeviceRequest::default(),
            tablet_display_map: None,
            object: None,
        }
    }
}

/// Referee state pushed to the robot on every retransmit tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStateMessage {
    /// Benchmark code
    pub benchmark_type: String,
    /// Current referee-side state
    pub benchmark_state: BenchmarkState,
    /// Echo of the last robot timestamp received
    pub acknowledgement: WireTime,
    /// Navigation target while a goal is being transmitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pose: Option<Pose2D>,
}

/// Announcement a robot broadcasts on the public channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotBeacon {
    /// Team name
    pub team_name: String,
    /// Robot name
    pub robot_name: String,
    /// Robot wall-clock time when the beacon was sent
    pub time: WireTime,
}

// ============================================================================
// Benchmarking box handshake
// ============================================================================

/// State owned and published by the benchmarking box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum BmBoxState {
    /// Box has not started
    #[default]
    Start = 0,
    /// Box is ready
    Ready = 1,
    /// Box is waiting for the referee box to connect
    WaitingClient = 2,
    /// Box asks the referee for a manual operation
    WaitingManualOperation = 3,
    /// Box is transmitting a goal
    TransmittingGoal = 4,
    /// Box is waiting for the robot's result
    WaitingResult = 5,
    /// Box is transmitting the score
    TransmittingScore = 6,
    /// Box finished
    End = 7,
}

/// Client state published on behalf of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ClientState {
    /// Not started
    #[default]
    Start = 0,
    /// Robot waits for a goal
    WaitingGoal = 1,
    /// Robot executes the goal
    ExecutingGoal = 2,
    /// Robot completed the goal
    CompletedGoal = 3,
    /// Trial ended
    End = 4,
}

/// Referee state published to the benchmarking box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RefBoxState {
    /// Not started
    #[default]
    Start = 0,
    /// Referee is ready
    Ready = 1,
    /// Referee is performing a manual operation
    ExecutingManualOperation = 2,
    /// Goal execution in progress
    ExecutingGoal = 3,
    /// Score received from the box
    ReceivedScore = 4,
    /// Trial ended
    End = 5,
}

/// `BmBoxState` plus its payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BmBoxMessage {
    /// Box state
    pub state: BmBoxState,
    /// Goal, manual-operation text or score
    #[serde(default)]
    pub payload: String,
}

/// `ClientState` plus its payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Client state
    pub state: ClientState,
    /// Result payload
    #[serde(default)]
    pub payload: String,
}

/// `RefBoxState` plus its payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RefBoxMessage {
    /// Referee state
    pub state: RefBoxState,
    /// Reason or annotation
    #[serde(default)]
    pub payload: String,
}

// ============================================================================
// Smart environment
// ============================================================================

/// Last known state of the smart-environment devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesState {
    /// Switch 1 on
    pub switch_1: bool,
    /// Switch 2 on
    pub switch_2: bool,
    /// Switch 3 on
    pub switch_3: bool,
    /// Blinds position (percent)
    pub blinds: u8,
    /// Dimmer level (percent)
    pub dimmer: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robot_state_accepts_minimal_json() {
        let json = r#"{
            "time": {"sec": 10, "nsec": 5},
            "team_name": "t1",
            "robot_name": "r1",
            "robot_state": "WAITING_GOAL"
        }"#;
        let msg: RobotState = serde_json::from_str(json).unwrap();
        assert_eq!(msg.robot_state, RobotStateCode::WaitingGoal);
        assert!(msg.notifications.is_empty());
        assert_eq!(msg.devices, DeviceRequest::default());
    }

    #[test]
    fn benchmark_state_message_omits_missing_pose() {
        let msg = BenchmarkStateMessage {
            benchmark_type: "HNF".to_string(),
            benchmark_state: BenchmarkState::GoalTx,
            acknowledgement: WireTime::default(),
            target_pose: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["benchmark_state"], "GOAL_TX");
        assert!(json.get("target_pose").is_none());
    }

    #[test]
    fn skew_is_signed() {
        let reference = DateTime::from_timestamp(100, 0).unwrap();
        let ahead = WireTime { sec: 102, nsec: 0 };
        let behind = WireTime { sec: 99, nsec: 500_000_000 };
        assert_eq!(ahead.skew_from(reference), TimeDelta::seconds(2));
        assert_eq!(behind.skew_from(reference), TimeDelta::milliseconds(-500));
    }

    #[test]
    fn handshake_states_use_wire_discriminants() {
        assert_eq!(RefBoxState::ReceivedScore as u8, 4);
        assert_eq!(ClientState::CompletedGoal as u8, 3);
        let msg: BmBoxMessage =
            serde_json::from_str(r#"{"state": "TRANSMITTING_SCORE"}"#).unwrap();
        assert_eq!(msg.state, BmBoxState::TransmittingScore);
        assert!(msg.payload.is_empty());
    }
}
