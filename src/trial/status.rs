//! Operator-facing status snapshot of one trial.

use chrono::TimeDelta;
use serde::Serialize;

use crate::config::{ScoreKind, ScoringItem};
use crate::messages::{BenchmarkState, delta_secs};

use super::lifecycle::Phase;

/// Everything the console shows for one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    /// Zone (event) identifier
    pub zone: String,
    /// Team running the trial
    pub team: String,
    /// Benchmark code
    pub benchmark: String,
    /// Coarse phase
    pub phase: Phase,
    /// Fine-grained state reported to the robot
    pub benchmark_state: BenchmarkState,
    /// Time left, in seconds; negative when overdue
    #[serde(serialize_with = "delta_secs::serialize")]
    pub timer: TimeDelta,
    /// `timer` formatted for display
    pub countdown: String,
    /// Status text, one line per fact
    pub state: String,
    /// Pending manual operation, empty when none
    pub manual_operation: String,
    /// Whether the start button is active
    pub start_enabled: bool,
    /// Whether the stop button is active
    pub stop_enabled: bool,
    /// Tail of the audit log
    pub log: Vec<String>,
    /// Tail of the robot's online data
    pub online_data: Vec<String>,
    /// Scoring table grouped in catalog order
    pub scoring: Vec<ScoreGroup>,
    /// Object manipulation panel, when active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub omf: Option<OmfPanel>,
}

impl StatusView {
    /// Appends a line to the status text.
    pub fn push_line(&mut self, line: impl AsRef<str>) {
        if !self.state.is_empty() {
            self.state.push('\n');
        }
        self.state.push_str(line.as_ref());
    }
}

/// Consecutive scoring items sharing a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreGroup {
    /// Group heading
    pub group_name: String,
    /// Rows in catalog order
    pub items: Vec<ScoreRow>,
}

/// One scoring row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreRow {
    /// Row description
    pub desc: String,
    /// Value kind
    #[serde(rename = "type")]
    pub kind: ScoreKind,
    /// Current value
    pub current_value: i64,
}

/// Switch panel shown while the referee records an object manipulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OmfPanel {
    /// Switches currently on
    pub switches: Vec<u32>,
    /// Damaged switch count
    pub damaged: u32,
    /// Whether the complete button is active
    pub complete: bool,
}

/// Groups consecutive items with the same group name. A group name that
/// reappears later starts a new group.
#[must_use]
pub fn group_scoring(items: &[ScoringItem]) -> Vec<ScoreGroup> {
    let mut groups: Vec<ScoreGroup> = Vec::new();
    for item in items {
        let row = ScoreRow {
            desc: item.desc.clone(),
            kind: item.kind,
            current_value: item.current_value,
        };
        match groups.last_mut() {
            Some(group) if group.group_name == item.group => group.items.push(row),
            _ => groups.push(ScoreGroup {
                group_name: item.group.clone(),
                items: vec![row],
            }),
        }
    }
    groups
}
