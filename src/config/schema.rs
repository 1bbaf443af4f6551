//! Configuration schema types.
//!
//! Raw serde shapes for the settings, benchmark catalog, password and
//! waypoint documents, plus the validated types the rest of the crate
//! consumes. Raw benchmark fields are optional so the loader can report
//! exactly which entry is missing what.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::Pose2D;

// ============================================================================
// Settings
// ============================================================================

/// Process-wide settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Silence after which a robot is forgotten.
    #[serde(with = "duration")]
    pub robot_timeout: Duration,

    /// Public beacon port; private channels are allocated above it.
    pub rsbb_port: u16,

    /// Address private-channel datagrams are sent to (usually a broadcast).
    pub rsbb_host: String,

    /// Grace window shown on the countdown after a trial stops.
    #[serde(with = "duration")]
    pub after_stop_duration: Duration,

    /// Lines kept in each trial's display buffers.
    pub display_log_size: usize,

    /// Lines of each display buffer included in a status snapshot.
    pub status_log_lines: usize,

    /// Offset added to switch ids received from the benchmarking box.
    pub switch_ids_bmbox_to_right: u32,

    /// Interval between state retransmissions.
    #[serde(with = "duration")]
    pub state_retransmit_interval: Duration,

    /// Clock skew above which the operator is warned.
    #[serde(with = "duration")]
    pub skew_warning_threshold: Duration,

    /// Robot silence above which the operator is warned.
    #[serde(with = "duration")]
    pub beacon_warning_threshold: Duration,

    /// Benchmark catalog document.
    pub benchmarks_file: PathBuf,

    /// Team password document.
    pub passwords_file: PathBuf,

    /// Directory for per-trial audit logs; none keeps them in memory only.
    pub log_dir: Option<PathBuf>,

    /// Address the operator console listens on.
    pub console_bind: String,

    /// How long a peer posting through the console bus bridge counts as a
    /// live publisher after its last post.
    #[serde(with = "duration")]
    pub bridge_publisher_ttl: Duration,

    /// Scheduled trials.
    pub schedule: Vec<ScheduleEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            robot_timeout: Duration::from_secs(30),
            rsbb_port: 6666,
            rsbb_host: "10.255.255.255".to_string(),
            after_stop_duration: Duration::from_secs(120),
            display_log_size: 3000,
            status_log_lines: 40,
            switch_ids_bmbox_to_right: 1,
            state_retransmit_interval: Duration::from_millis(200),
            skew_warning_threshold: Duration::from_millis(500),
            beacon_warning_threshold: Duration::from_secs(5),
            benchmarks_file: PathBuf::from("benchmarks.yaml"),
            passwords_file: PathBuf::from("passwords.yaml"),
            log_dir: None,
            console_bind: "127.0.0.1:8080".to_string(),
            bridge_publisher_ttl: Duration::from_secs(10),
            schedule: Vec::new(),
        }
    }
}

/// One scheduled trial as written in the settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    /// Team name (ignored by fleet benchmarks)
    pub team: String,
    /// Round number
    pub round: u32,
    /// Run number
    pub run: u32,
    /// Benchmark code
    pub benchmark: String,
    /// Robot to drive; defaults to whichever robot of the team is present
    #[serde(default)]
    pub robot: Option<String>,
}

// ============================================================================
// Benchmark catalog
// ============================================================================

/// How a benchmark is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialKind {
    /// One robot, no external device
    #[default]
    Simple,
    /// One robot synchronized with a benchmarking box
    External,
    /// Every present idle robot at once
    Fleet,
}

impl TrialKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::External => "external",
            Self::Fleet => "fleet",
        }
    }
}

/// Per-goal behaviour of an externally-synchronized benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    /// Robot reports a recognised object and pose
    ObjectPerception,
    /// Referee records toggled switches after the robot finishes
    ObjectManipulation,
    /// Robot visits a list of waypoints
    Navigation,
}

/// Kind of value a scoring item holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// 0 or 1
    Bool,
    /// Non-negative counter
    Uint,
}

/// One row of a benchmark's scoring table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringItem {
    /// Group heading
    pub group: String,
    /// Row description
    pub desc: String,
    /// Value kind
    #[serde(rename = "type")]
    pub kind: ScoreKind,
    /// Current value
    #[serde(default)]
    pub current_value: i64,
}

/// Benchmark entry as written in the catalog document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBenchmark {
    /// Display name
    pub name: Option<String>,
    /// Long description
    pub desc: Option<String>,
    /// Unique code
    pub code: Option<String>,
    /// Per-trial (or per-goal) timeout
    #[serde(default, with = "opt_duration")]
    pub timeout: Option<Duration>,
    /// Session budget across goals
    #[serde(default, with = "opt_duration")]
    pub total_timeout: Option<Duration>,
    /// Trial kind
    #[serde(default)]
    pub kind: TrialKind,
    /// Goal behaviour (external kind only)
    pub goal: Option<GoalKind>,
    /// Bus topic prefix of the benchmarking box (external kind only)
    pub bmbox_prefix: Option<String>,
    /// Forward device requests to the smart environment
    #[serde(default)]
    pub device_control: bool,
    /// Waypoint document (navigation goals only)
    pub waypoints_file: Option<PathBuf>,
    /// Scoring template
    #[serde(default)]
    pub scoring: Vec<ScoringItem>,
}

/// Validated benchmark descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkDescriptor {
    /// Display name
    pub name: String,
    /// Long description
    pub desc: String,
    /// Unique code
    pub code: String,
    /// Per-trial (or per-goal) timeout
    pub timeout: Duration,
    /// Session budget across goals; equals `timeout` unless configured
    pub total_timeout: Duration,
    /// Trial kind
    pub kind: TrialKind,
    /// Forward device requests to the smart environment
    pub device_control: bool,
    /// Benchmarking box settings (external kind only)
    pub external: Option<ExternalSpec>,
    /// Scoring template
    pub scoring: Vec<ScoringItem>,
}

/// Benchmarking-box settings of an externally-synchronized benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSpec {
    /// Goal behaviour
    pub goal: GoalKind,
    /// Bus topic prefix, ending in `/`
    pub bmbox_prefix: String,
    /// Waypoints (navigation goals only)
    pub waypoints: Option<Waypoints>,
}

/// Validated benchmark catalog keyed by code.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    benchmarks: BTreeMap<String, Arc<BenchmarkDescriptor>>,
}

impl Catalog {
    /// Builds a catalog from validated descriptors.
    #[must_use]
    pub fn new(benchmarks: BTreeMap<String, Arc<BenchmarkDescriptor>>) -> Self {
        Self { benchmarks }
    }

    /// Looks up a benchmark by code.
    #[must_use]
    pub fn get(&self, code: &str) -> Option<&Arc<BenchmarkDescriptor>> {
        self.benchmarks.get(code)
    }

    /// All codes in order.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.benchmarks.keys().map(String::as_str)
    }

    /// Number of benchmarks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }
}

// ============================================================================
// Passwords
// ============================================================================

/// Team → private channel secret.
#[derive(Debug, Clone, Default)]
pub struct Passwords {
    by_team: BTreeMap<String, String>,
}

impl Passwords {
    /// Builds the table from a team map.
    #[must_use]
    pub const fn new(by_team: BTreeMap<String, String>) -> Self {
        Self { by_team }
    }

    /// Secret of `team`.
    #[must_use]
    pub fn get(&self, team: &str) -> Option<&str> {
        self.by_team.get(team).map(String::as_str)
    }

    /// Number of teams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_team.len()
    }

    /// Whether no team has a password.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_team.is_empty()
    }
}

// ============================================================================
// Waypoints
// ============================================================================

/// Waypoint document as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWaypointsFile {
    /// The only section
    pub goal: Option<RawWaypointGoal>,
}

/// Goal section of a waypoint document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWaypointGoal {
    /// Pose the robot starts at
    pub starting_pose: Option<Vec<f64>>,
    /// Penalty applied per missed waypoint, in seconds
    pub penalty_time: Option<f64>,
    /// Per-waypoint timeout, in seconds
    pub timeout_time: Option<f64>,
    /// `[x, y, theta]` triples
    pub waypoints: Option<Vec<Vec<f64>>>,
}

/// Validated navigation waypoints.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Waypoints {
    /// Pose the robot starts at
    pub starting_pose: Vec<f64>,
    /// Penalty applied per missed waypoint, in seconds
    pub penalty_time: f64,
    /// Per-waypoint timeout, in seconds
    pub timeout_time: f64,
    /// Targets in visiting order
    pub points: Vec<Pose2D>,
}

impl Waypoints {
    /// Human-readable summary written to the audit log when a trial loads
    /// the waypoints.
    #[must_use]
    pub fn summary(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::from("Waypoint configuration:\n");
        let _ = writeln!(out, "Penalty Time: {}", self.penalty_time);
        let _ = writeln!(out, "Timeout Time: {}", self.timeout_time);
        let _ = writeln!(out, "Starting Pose: {:?}", self.starting_pose);
        let _ = writeln!(out, "Waypoints:");
        for (idx, point) in self.points.iter().enumerate() {
            let _ = writeln!(
                out,
                "\tWP #{idx}: [ {} {} {} ]",
                point.x, point.y, point.theta
            );
        }
        out
    }
}

// ============================================================================
// Trial events
// ============================================================================

/// Immutable description of one trial instance.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialEvent {
    /// Team name
    pub team: String,
    /// Round number
    pub round: u32,
    /// Run number
    pub run: u32,
    /// Robot override; otherwise any present robot of the team
    pub robot: Option<String>,
    /// Benchmark to run
    pub benchmark: Arc<BenchmarkDescriptor>,
    /// Private channel secret (empty for fleet events)
    pub password: String,
}

impl TrialEvent {
    /// Stable identifier used as the zone key.
    #[must_use]
    pub fn id(&self) -> String {
        let team: String = self
            .team
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}-{team}-r{}-{}", self.benchmark.code, self.round, self.run)
    }

    /// Copy of this event retargeted at another team, as used by fleet
    /// trials for their per-robot sub-trials.
    #[must_use]
    pub fn for_team(&self, team: &str, password: &str) -> Self {
        Self {
            team: team.to_string(),
            robot: None,
            password: password.to_string(),
            ..self.clone()
        }
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(f64),
    Text(String),
}

fn parse_raw_duration(raw: RawDuration) -> Result<Duration, String> {
    match raw {
        RawDuration::Seconds(secs) if secs.is_finite() && secs >= 0.0 => {
            Ok(Duration::from_secs_f64(secs))
        }
        RawDuration::Seconds(secs) => Err(format!("invalid duration {secs}")),
        RawDuration::Text(text) => humantime::parse_duration(&text).map_err(|e| e.to_string()),
    }
}

/// Durations written as humantime strings (`"30s"`, `"2m"`) or bare seconds.
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{RawDuration, parse_raw_duration};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        parse_raw_duration(RawDuration::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}

mod opt_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    use super::{RawDuration, parse_raw_duration};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(parse_raw_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_fill_missing_keys() {
        let settings: Settings = serde_yaml::from_str("rsbb_port: 7000").unwrap();
        assert_eq!(settings.rsbb_port, 7000);
        assert_eq!(settings.robot_timeout, Duration::from_secs(30));
        assert_eq!(settings.state_retransmit_interval, Duration::from_millis(200));
        assert!(settings.schedule.is_empty());
    }

    #[test]
    fn durations_accept_text_and_seconds() {
        let settings: Settings =
            serde_yaml::from_str("robot_timeout: 45s\nafter_stop_duration: 90").unwrap();
        assert_eq!(settings.robot_timeout, Duration::from_secs(45));
        assert_eq!(settings.after_stop_duration, Duration::from_secs(90));
    }

    #[test]
    fn unknown_settings_key_is_rejected() {
        assert!(serde_yaml::from_str::<Settings>("rsbb_prot: 7000").is_err());
    }

    #[test]
    fn scoring_item_reads_type_key() {
        let item: ScoringItem =
            serde_yaml::from_str("{group: Main, desc: Reached, type: bool}").unwrap();
        assert_eq!(item.kind, ScoreKind::Bool);
        assert_eq!(item.current_value, 0);
    }

    #[test]
    fn event_id_is_path_safe() {
        let event = TrialEvent {
            team: "b-it bots".to_string(),
            round: 1,
            run: 2,
            robot: None,
            benchmark: Arc::new(BenchmarkDescriptor {
                name: "Navigation".to_string(),
                desc: String::new(),
                code: "HNF".to_string(),
                timeout: Duration::from_secs(60),
                total_timeout: Duration::from_secs(60),
                kind: TrialKind::External,
                device_control: false,
                external: None,
                scoring: Vec::new(),
            }),
            password: "secret".to_string(),
        };
        assert_eq!(event.id(), "HNF-b-it_bots-r1-2");
        let retargeted = event.for_team("other", "pw");
        assert_eq!(retargeted.team, "other");
        assert_eq!(retargeted.round, 1);
    }
}
