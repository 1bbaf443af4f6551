//! Append-only audit log of a single trial.
//!
//! Every state change, score, and annotated value of a trial is written as one
//! JSON line carrying a sequence number and the trial identity. Each record is
//! also echoed to a [`DisplayText`] buffer so the operator console can show
//! the recent history without reading the file back.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::display::DisplayText;
use crate::messages::BenchmarkState;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    /// Benchmark state or description changed.
    StateChange {
        /// When the change happened.
        timestamp: DateTime<Utc>,
        /// New state.
        state: BenchmarkState,
        /// Status description.
        desc: String,
    },

    /// A scoring item was updated.
    Score {
        /// When the score was recorded.
        timestamp: DateTime<Utc>,
        /// Scoring group.
        group: String,
        /// Item description.
        desc: String,
        /// New value.
        value: i64,
    },

    /// Free-form text on a topic.
    Text {
        /// When the value was logged.
        timestamp: DateTime<Utc>,
        /// Topic name.
        topic: String,
        /// Logged text.
        value: String,
    },

    /// Small integer value on a topic.
    Byte {
        /// When the value was logged.
        timestamp: DateTime<Utc>,
        /// Topic name.
        topic: String,
        /// Logged value.
        value: u8,
    },

    /// The trial was disposed.
    End {
        /// When the trial ended.
        timestamp: DateTime<Utc>,
    },
}

impl AuditRecord {
    fn display_line(&self) -> String {
        match self {
            Self::StateChange {
                timestamp,
                state,
                desc,
            } => format!("{} state {state}: {desc}", timestamp.format("%H:%M:%S")),
            Self::Score {
                timestamp,
                group,
                desc,
                value,
            } => format!("{} score {group} / {desc}: {value}", timestamp.format("%H:%M:%S")),
            Self::Text {
                timestamp,
                topic,
                value,
            } => format!("{} {topic}: {value}", timestamp.format("%H:%M:%S")),
            Self::Byte {
                timestamp,
                topic,
                value,
            } => format!("{} {topic}: {value}", timestamp.format("%H:%M:%S")),
            Self::End { timestamp } => format!("{} log closed", timestamp.format("%H:%M:%S")),
        }
    }
}

/// Identity stamped on every record of a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialIdentity {
    /// Team name
    pub team: String,
    /// Round number
    pub round: u32,
    /// Run number
    pub run: u32,
    /// Benchmark code
    pub benchmark: String,
    /// Identifier of this referee-box process run
    pub run_uuid: Uuid,
}

#[derive(Debug, Serialize)]
struct AuditEnvelope<'a> {
    sequence: u64,
    #[serde(flatten)]
    identity: &'a TrialIdentity,
    #[serde(flatten)]
    record: &'a AuditRecord,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// Buffered JSONL audit writer owned by one trial.
///
/// Serialization or I/O failures are dropped; auditing must never stop a
/// running trial.
pub struct RunLog {
    writer: BufWriter<Box<dyn Write + Send>>,
    identity: TrialIdentity,
    sequence: u64,
    display: DisplayText,
    ended: bool,
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("identity", &self.identity)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl RunLog {
    /// Creates a log writing to `writer`, echoing into a display buffer of
    /// `display_capacity` lines.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>, identity: TrialIdentity, display_capacity: usize) -> Self {
        Self {
            writer: BufWriter::new(writer),
            identity,
            sequence: 0,
            display: DisplayText::new(display_capacity),
            ended: false,
        }
    }

    /// Creates a log that keeps only the display echo.
    #[must_use]
    pub fn noop(identity: TrialIdentity, display_capacity: usize) -> Self {
        Self::new(Box::new(std::io::sink()), identity, display_capacity)
    }

    /// Creates a log file for the trial under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be created.
    pub fn from_dir(dir: &Path, identity: TrialIdentity, display_capacity: usize) -> std::io::Result<Self> {
        let path = log_path(dir, &identity);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        tracing::debug!(path = %path.display(), "audit log opened");
        Ok(Self::new(Box::new(file), identity, display_capacity))
    }

    /// Opens a file log under `dir` when given, falling back to
    /// [`noop`](Self::noop) on failure.
    #[must_use]
    pub fn open(dir: Option<&Path>, identity: TrialIdentity, display_capacity: usize) -> Self {
        match dir {
            Some(dir) => match Self::from_dir(dir, identity.clone(), display_capacity) {
                Ok(log) => log,
                Err(error) => {
                    tracing::warn!(%error, dir = %dir.display(), "cannot open audit log, records will not be persisted");
                    Self::noop(identity, display_capacity)
                }
            },
            None => Self::noop(identity, display_capacity),
        }
    }

    /// Identity stamped on every record.
    #[must_use]
    pub const fn identity(&self) -> &TrialIdentity {
        &self.identity
    }

    /// Display echo of the records written so far.
    #[must_use]
    pub const fn display(&self) -> &DisplayText {
        &self.display
    }

    /// Number of records written.
    #[must_use]
    pub const fn record_count(&self) -> u64 {
        self.sequence
    }

    /// Logs a state change.
    pub fn state_change(&mut self, state: BenchmarkState, desc: &str) {
        self.write(AuditRecord::StateChange {
            timestamp: Utc::now(),
            state,
            desc: desc.to_string(),
        });
    }

    /// Logs a score update.
    pub fn score(&mut self, group: &str, desc: &str, value: i64) {
        self.write(AuditRecord::Score {
            timestamp: Utc::now(),
            group: group.to_string(),
            desc: desc.to_string(),
            value,
        });
    }

    /// Logs text on a topic.
    pub fn text(&mut self, topic: &str, value: &str) {
        self.write(AuditRecord::Text {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            value: value.to_string(),
        });
    }

    /// Logs a small integer on a topic.
    pub fn byte(&mut self, topic: &str, value: u8) {
        self.write(AuditRecord::Byte {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            value,
        });
    }

    /// Writes the closing record. Further calls are ignored.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.write(AuditRecord::End {
            timestamp: Utc::now(),
        });
        self.ended = true;
    }

    fn write(&mut self, record: AuditRecord) {
        if self.ended {
            return;
        }
        self.display.push(&record.display_line());
        let envelope = AuditEnvelope {
            sequence: self.sequence,
            identity: &self.identity,
            record: &record,
        };
        self.sequence += 1;
        if let Ok(line) = serde_json::to_string(&envelope) {
            let _ = writeln!(self.writer, "{line}");
            let _ = self.writer.flush();
        }
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        self.end();
    }
}

/// `<dir>/<run uuid>/<team>_<code>_r<round>_<run>.jsonl`, with the team name
/// reduced to filesystem-safe characters.
fn log_path(dir: &Path, identity: &TrialIdentity) -> PathBuf {
    let team: String = identity
        .team
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(identity.run_uuid.to_string()).join(format!(
        "{team}_{}_r{}_{}.jsonl",
        identity.benchmark, identity.round, identity.run
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;

    #[derive(Clone)]
    struct TestWriter(Arc<StdMutex<Vec<u8>>>);

    impl TestWriter {
        fn new() -> Self {
            Self(Arc::new(StdMutex::new(Vec::new())))
        }

        fn lines(&self) -> Vec<serde_json::Value> {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf)
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn identity() -> TrialIdentity {
        TrialIdentity {
            team: "team a/b".to_string(),
            round: 2,
            run: 1,
            benchmark: "HPFF".to_string(),
            run_uuid: Uuid::nil(),
        }
    }

    #[test]
    fn records_carry_identity_and_sequence() {
        let tw = TestWriter::new();
        let mut log = RunLog::new(Box::new(tw.clone()), identity(), 10);
        log.state_change(BenchmarkState::Prepare, "Robot preparing for task");
        log.byte("client_state", 3);

        let lines = tw.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "state_change");
        assert_eq!(lines[0]["state"], "PREPARE");
        assert_eq!(lines[0]["team"], "team a/b");
        assert_eq!(lines[0]["sequence"], 0);
        assert_eq!(lines[1]["type"], "byte");
        assert_eq!(lines[1]["value"], 3);
        assert_eq!(lines[1]["sequence"], 1);
    }

    #[test]
    fn end_is_written_once_and_closes_log() {
        let tw = TestWriter::new();
        let mut log = RunLog::new(Box::new(tw.clone()), identity(), 10);
        log.end();
        log.text("late", "ignored");
        drop(log);

        let lines = tw.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "end");
    }

    #[test]
    fn records_are_echoed_to_display() {
        let mut log = RunLog::noop(identity(), 10);
        log.score("Main", "Task done", 1);
        let shown = log.display().last(1);
        assert!(shown[0].ends_with("score Main / Task done: 1"));
    }

    #[test]
    fn file_log_lands_under_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RunLog::from_dir(dir.path(), identity(), 10).unwrap();
        log.text("waypoints_loading", "none");
        drop(log);

        let path = dir
            .path()
            .join(Uuid::nil().to_string())
            .join("team_a_b_HPFF_r2_1.jsonl");
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
