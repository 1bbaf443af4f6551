//! Error types for `rsbb`
//!
//! Error hierarchy and process exit codes. Configuration errors are fatal at
//! startup; transport and trial errors are reported and recovered where they
//! occur so a single misbehaving robot cannot take the referee box down.

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for `rsbb` CLI operations.
///
/// These codes follow Unix conventions.
pub struct ExitCode;

impl ExitCode {
    /// Successful execution
    pub const SUCCESS: i32 = 0;

    /// Configuration error (invalid YAML, unknown benchmark, missing password)
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error (file not found, permission denied)
    pub const IO_ERROR: i32 = 3;

    /// Transport error (port unavailable, socket failure)
    pub const TRANSPORT_ERROR: i32 = 4;

    /// Trial error (unknown zone, protocol invariant violated)
    pub const TRIAL_ERROR: i32 = 5;

    /// Usage error (invalid arguments, missing required options)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `rsbb` operations.
///
/// Aggregates the domain errors and maps each of them to an exit code.
#[derive(Debug, Error)]
pub enum RsbbError {
    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Robot channel or bus error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Trial lifecycle error
    #[error(transparent)]
    Trial(#[from] TrialError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RsbbError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Json(_) | Self::Yaml(_) => ExitCode::CONFIG_ERROR,
            Self::Transport(_) => ExitCode::TRANSPORT_ERROR,
            Self::Trial(_) => ExitCode::TRIAL_ERROR,
            Self::Io(_) => ExitCode::IO_ERROR,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration loading and validation errors.
///
/// Every one of these aborts startup: a referee box with a broken benchmark
/// catalog or schedule must not run trials.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed
    #[error("parse error in {}: {message}", .path.display())]
    ParseError {
        /// Path to the configuration file
        path: PathBuf,
        /// Line number where the error occurred (if available)
        line: Option<usize>,
        /// Error message from the parser
        message: String,
    },

    /// Referenced configuration file not found
    #[error("file not found: {}", .path.display())]
    MissingFile {
        /// Path to the missing file
        path: PathBuf,
    },

    /// Document has the wrong top-level shape
    #[error("{} is not {expected}", .path.display())]
    InvalidDocument {
        /// Path to the configuration file
        path: PathBuf,
        /// What the top-level node should have been
        expected: String,
    },

    /// Required field is missing from configuration
    #[error("missing required field '{field}' at {location}")]
    MissingRequired {
        /// Name of the missing field
        field: String,
        /// Location in the configuration (e.g., "benchmarks[2]")
        location: String,
    },

    /// Field has an invalid value
    #[error("invalid value for '{field}': got '{value}', expected {expected}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The actual value provided
        value: String,
        /// Description of what was expected
        expected: String,
    },

    /// Schedule references a benchmark code the catalog does not define
    #[error("unknown benchmark code '{code}'{hint}")]
    UnknownBenchmark {
        /// The code that failed to resolve
        code: String,
        /// Pre-formatted "did you mean" hint (may be empty)
        hint: String,
    },

    /// Benchmark code appears twice in the catalog
    #[error("duplicate benchmark code '{code}'")]
    DuplicateBenchmark {
        /// The repeated code
        code: String,
    },

    /// Team scheduled for a trial has no password
    #[error("no password configured for team '{team}'")]
    MissingPassword {
        /// Team name
        team: String,
    },

    /// Benchmark cannot run as the declared trial kind
    #[error("cannot execute benchmark '{code}' as {kind} trial: {reason}")]
    UnsupportedKind {
        /// Benchmark code
        code: String,
        /// Declared trial kind
        kind: String,
        /// What is missing or inconsistent
        reason: String,
    },

    /// Strict validation found warnings
    #[error("{}: {count} warning(s) in strict mode", .path.display())]
    StrictWarnings {
        /// Settings file that produced them
        path: PathBuf,
        /// Number of warnings
        count: usize,
    },
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Robot channel and bus errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during transport operations
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A private channel could not claim its port
    #[error("port {port} unavailable: {source}")]
    PortUnavailable {
        /// Port that could not be bound
        port: u16,
        /// Underlying bind failure
        source: std::io::Error,
    },

    /// Datagram failed authentication against the team password
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed datagram or message envelope
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// Trial Errors
// ============================================================================

/// Trial lifecycle and coordination errors.
#[derive(Debug, Error)]
pub enum TrialError {
    /// Robot drove the trial into a state its kind never enters
    #[error("{kind} trial reached invalid state {state}")]
    InvalidState {
        /// Trial kind name
        kind: &'static str,
        /// The offending benchmark state
        state: String,
    },

    /// No zone is open for the given event id
    #[error("zone not found: {0}")]
    UnknownZone(String),

    /// A zone is already open for the given event id
    #[error("zone already connected: {0}")]
    ZoneExists(String),

    /// No scheduled event matches the given id
    #[error("event not scheduled: {0}")]
    UnknownEvent(String),

    /// Single-robot trial requested but no robot of the team is present
    #[error("no robot of team '{team}' is currently present")]
    NoRobot {
        /// Team name
        team: String,
    },

    /// Team already owns a running trial
    #[error("team '{team}' is already executing a benchmark")]
    TeamBusy {
        /// Team name
        team: String,
    },

    /// Team has no password to key its private channel
    #[error("no password for team '{team}'")]
    NoPassword {
        /// Team name
        team: String,
    },

    /// The trial task has already exited
    #[error("trial {0} is no longer running")]
    Stopped(String),

    /// Private channel failed for a reason other than port contention
    #[error("private channel error: {0}")]
    Channel(#[from] TransportError),
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for `rsbb` operations.
pub type Result<T> = std::result::Result<T, RsbbError>;

// ============================================================================
// Tests
// ============================================================================
