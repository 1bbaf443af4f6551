//! Configuration loader.
//!
//! Loading pipeline:
//! 1. Read and parse the settings document
//! 2. Resolve the catalog and password documents relative to it
//! 3. Validate every benchmark, loading waypoint documents on the way
//! 4. Resolve the schedule against the catalog and passwords
//! 5. Freeze with `Arc`
//!
//! Any failure is a [`ConfigError`] and aborts startup.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::Value;

use crate::config::schema::{
    BenchmarkDescriptor, Catalog, ExternalSpec, GoalKind, Passwords, RawBenchmark,
    RawWaypointsFile, ScheduleEntry, Settings, TrialEvent, TrialKind, Waypoints,
};
use crate::error::ConfigError;
use crate::messages::Pose2D;

// ============================================================================
// Public API
// ============================================================================

/// Options for the configuration loader.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Maximum size of any single document in bytes.
    pub max_document_size: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_document_size: env_or("RSBB_MAX_CONFIG_SIZE", 4 * 1024 * 1024),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct RsbbConfig {
    /// Process-wide settings
    pub settings: Settings,
    /// Benchmark catalog
    pub catalog: Catalog,
    /// Team passwords
    pub passwords: Passwords,
    /// Scheduled trials in document order
    pub schedule: Vec<TrialEvent>,
}

/// Result of loading a configuration.
#[derive(Debug)]
pub struct LoadResult {
    /// The loaded and validated configuration.
    pub config: Arc<RsbbConfig>,

    /// Warnings encountered during loading.
    pub warnings: Vec<LoadWarning>,
}

/// Non-fatal issue found while loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadWarning {
    /// Warning message.
    pub message: String,

    /// Location where the warning occurred.
    pub location: Option<String>,
}

/// Configuration loader.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: LoaderOptions,
}

impl ConfigLoader {
    /// Creates a loader with the given options.
    #[must_use]
    pub const fn new(options: LoaderOptions) -> Self {
        Self { options }
    }

    /// Creates a loader with default options.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(LoaderOptions::default())
    }

    /// Loads the settings document at `path` and everything it references.
    ///
    /// # Errors
    ///
    /// Returns an error if any document is missing or malformed, a benchmark
    /// is incomplete for its kind, or the schedule references an unknown
    /// benchmark or a team without a password.
    pub fn load(&self, path: &Path) -> Result<LoadResult, ConfigError> {
        let mut warnings = Vec::new();
        let base_dir = parent_dir(path);

        let text = self.read(path)?;
        let mut settings: Settings = parse_yaml(&text, path)?;
        settings.benchmarks_file = resolve(&base_dir, &settings.benchmarks_file);
        settings.passwords_file = resolve(&base_dir, &settings.passwords_file);
        settings.log_dir = settings.log_dir.as_deref().map(|dir| resolve(&base_dir, dir));

        let catalog = self.load_catalog(&settings.benchmarks_file)?;
        let passwords = self.load_passwords(&settings.passwords_file)?;

        for code in catalog.codes() {
            if catalog.get(code).is_some_and(|b| b.scoring.is_empty()) {
                warnings.push(LoadWarning {
                    message: format!("benchmark '{code}' has no scoring items"),
                    location: Some(settings.benchmarks_file.display().to_string()),
                });
            }
        }
        if settings.schedule.is_empty() {
            warnings.push(LoadWarning {
                message: "schedule is empty; no trial can be connected".to_string(),
                location: Some(path.display().to_string()),
            });
        }

        let schedule = build_schedule(&settings.schedule, &catalog, &passwords)?;

        Ok(LoadResult {
            config: Arc::new(RsbbConfig {
                settings,
                catalog,
                passwords,
                schedule,
            }),
            warnings,
        })
    }

    /// Loads and validates a benchmark catalog document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is missing, malformed, or contains
    /// an incomplete benchmark.
    pub fn load_catalog(&self, path: &Path) -> Result<Catalog, ConfigError> {
        let text = self.read(path)?;
        let base_dir = parent_dir(path);
        parse_catalog(&text, path, |file| {
            let file = resolve(&base_dir, file);
            let text = self.read(&file)?;
            parse_waypoints(&text, &file)
        })
    }

    /// Loads a password document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is missing or is not a map of
    /// strings.
    pub fn load_passwords(&self, path: &Path) -> Result<Passwords, ConfigError> {
        let text = self.read(path)?;
        parse_passwords(&text, path)
    }

    fn read(&self, path: &Path) -> Result<String, ConfigError> {
        let metadata = std::fs::metadata(path).map_err(|_| ConfigError::MissingFile {
            path: path.to_path_buf(),
        })?;
        let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if size > self.options.max_document_size {
            return Err(ConfigError::InvalidValue {
                field: "file_size".to_string(),
                value: format!("{size} bytes"),
                expected: format!("at most {} bytes", self.options.max_document_size),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::MissingFile {
            path: path.to_path_buf(),
        })?;
        // Handle UTF-8 BOM
        Ok(text
            .strip_prefix('\u{feff}')
            .map_or_else(|| text.clone(), str::to_string))
    }
}

// ============================================================================
// Document parsers
// ============================================================================

/// Parses a benchmark catalog. `load_waypoints` resolves and parses the
/// waypoint document of navigation benchmarks.
///
/// # Errors
///
/// Returns an error if the document is not a sequence of complete
/// benchmarks with unique codes.
pub fn parse_catalog<F>(text: &str, path: &Path, mut load_waypoints: F) -> Result<Catalog, ConfigError>
where
    F: FnMut(&Path) -> Result<Waypoints, ConfigError>,
{
    let root: Value = parse_yaml(text, path)?;
    let Value::Sequence(entries) = root else {
        return Err(ConfigError::InvalidDocument {
            path: path.to_path_buf(),
            expected: "a sequence of benchmarks".to_string(),
        });
    };

    let mut benchmarks = BTreeMap::new();
    for (idx, entry) in entries.into_iter().enumerate() {
        let location = format!("{}: benchmarks[{idx}]", path.display());
        let raw: RawBenchmark = serde_yaml::from_value(entry).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            line: None,
            message: format!("benchmarks[{idx}]: {e}"),
        })?;
        let descriptor = validate_benchmark(raw, &location, &mut load_waypoints)?;
        let code = descriptor.code.clone();
        if benchmarks.insert(code.clone(), Arc::new(descriptor)).is_some() {
            return Err(ConfigError::DuplicateBenchmark { code });
        }
    }
    Ok(Catalog::new(benchmarks))
}

/// Parses a password document mapping team names to secrets.
///
/// # Errors
///
/// Returns an error if the document is not a map of string keys to scalar
/// values.
pub fn parse_passwords(text: &str, path: &Path) -> Result<Passwords, ConfigError> {
    let root: Value = parse_yaml(text, path)?;
    let Value::Mapping(map) = root else {
        return Err(ConfigError::InvalidDocument {
            path: path.to_path_buf(),
            expected: "a map of team names to passwords".to_string(),
        });
    };

    let mut by_team = BTreeMap::new();
    for (key, value) in map {
        let team = match key {
            Value::String(team) => team,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "team".to_string(),
                    value: format!("{other:?}"),
                    expected: "a team name".to_string(),
                });
            }
        };
        let password = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(ConfigError::InvalidValue {
                    field: format!("password of {team}"),
                    value: format!("{other:?}"),
                    expected: "a string".to_string(),
                });
            }
        };
        by_team.insert(team, password);
    }
    Ok(Passwords::new(by_team))
}

/// Parses a waypoint document.
///
/// # Errors
///
/// Returns an error if any of `starting_pose`, `penalty_time`,
/// `timeout_time` or `waypoints` is missing, or a waypoint is not an
/// `[x, y, theta]` triple.
pub fn parse_waypoints(text: &str, path: &Path) -> Result<Waypoints, ConfigError> {
    let raw: RawWaypointsFile = parse_yaml(text, path)?;
    let location = path.display().to_string();
    let missing = |field: &str| ConfigError::MissingRequired {
        field: field.to_string(),
        location: location.clone(),
    };

    let goal = raw.goal.ok_or_else(|| missing("goal"))?;
    let starting_pose = goal.starting_pose.ok_or_else(|| missing("goal.starting_pose"))?;
    let penalty_time = goal.penalty_time.ok_or_else(|| missing("goal.penalty_time"))?;
    let timeout_time = goal.timeout_time.ok_or_else(|| missing("goal.timeout_time"))?;
    let raw_points = goal.waypoints.ok_or_else(|| missing("goal.waypoints"))?;

    let points = raw_points
        .into_iter()
        .enumerate()
        .map(|(idx, point)| match point.as_slice() {
            [x, y, theta] => Ok(Pose2D {
                x: *x,
                y: *y,
                theta: *theta,
            }),
            _ => Err(ConfigError::InvalidValue {
                field: format!("goal.waypoints[{idx}]"),
                value: format!("{point:?}"),
                expected: "[x, y, theta]".to_string(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Waypoints {
        starting_pose,
        penalty_time,
        timeout_time,
        points,
    })
}

/// Resolves schedule entries against the catalog and passwords.
///
/// # Errors
///
/// Returns an error for an unknown benchmark code, a non-fleet entry whose
/// team has no password, or two entries with the same identifier.
pub fn build_schedule(
    entries: &[ScheduleEntry],
    catalog: &Catalog,
    passwords: &Passwords,
) -> Result<Vec<TrialEvent>, ConfigError> {
    let mut seen = BTreeSet::new();
    let mut events = Vec::with_capacity(entries.len());

    for entry in entries {
        let benchmark = catalog.get(&entry.benchmark).ok_or_else(|| {
            let hint = suggest_code(&entry.benchmark, catalog)
                .map(|code| format!(" (did you mean '{code}'?)"))
                .unwrap_or_default();
            ConfigError::UnknownBenchmark {
                code: entry.benchmark.clone(),
                hint,
            }
        })?;

        let password = if benchmark.kind == TrialKind::Fleet {
            String::new()
        } else {
            passwords
                .get(&entry.team)
                .ok_or_else(|| ConfigError::MissingPassword {
                    team: entry.team.clone(),
                })?
                .to_string()
        };

        let event = TrialEvent {
            team: entry.team.clone(),
            round: entry.round,
            run: entry.run,
            robot: entry.robot.clone(),
            benchmark: Arc::clone(benchmark),
            password,
        };
        let id = event.id();
        if !seen.insert(id.clone()) {
            return Err(ConfigError::InvalidValue {
                field: "schedule".to_string(),
                value: id,
                expected: "unique (benchmark, team, round, run) entries".to_string(),
            });
        }
        events.push(event);
    }
    Ok(events)
}

/// Suggests the closest catalog code for a misspelled one.
#[must_use]
pub fn suggest_code(input: &str, catalog: &Catalog) -> Option<String> {
    catalog
        .codes()
        .map(|code| (code, strsim::damerau_levenshtein(input, code)))
        .filter(|(_, dist)| *dist <= 2)
        .min_by_key(|(_, dist)| *dist)
        .map(|(code, _)| code.to_string())
}

// ============================================================================
// Validation
// ============================================================================

fn validate_benchmark<F>(
    raw: RawBenchmark,
    location: &str,
    load_waypoints: &mut F,
) -> Result<BenchmarkDescriptor, ConfigError>
where
    F: FnMut(&Path) -> Result<Waypoints, ConfigError>,
{
    let missing = |field: &str| ConfigError::MissingRequired {
        field: field.to_string(),
        location: location.to_string(),
    };
    let name = raw.name.ok_or_else(|| missing("name"))?;
    let desc = raw.desc.ok_or_else(|| missing("desc"))?;
    let code = raw.code.ok_or_else(|| missing("code"))?;
    let timeout = raw.timeout.ok_or_else(|| missing("timeout"))?;
    let total_timeout = raw.total_timeout.unwrap_or(timeout);

    let unsupported = |reason: &str| ConfigError::UnsupportedKind {
        code: code.clone(),
        kind: raw.kind.as_str().to_string(),
        reason: reason.to_string(),
    };

    let external = match raw.kind {
        TrialKind::External => {
            let goal = raw.goal.ok_or_else(|| unsupported("no goal kind"))?;
            let mut prefix = raw
                .bmbox_prefix
                .clone()
                .ok_or_else(|| unsupported("no bmbox_prefix"))?;
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            let waypoints = if goal == GoalKind::Navigation {
                let file = raw
                    .waypoints_file
                    .as_deref()
                    .ok_or_else(|| unsupported("navigation goals need a waypoints_file"))?;
                let waypoints = load_waypoints(file)?;
                if waypoints.points.is_empty() {
                    return Err(unsupported("waypoints file lists no waypoints"));
                }
                Some(waypoints)
            } else {
                None
            };
            Some(ExternalSpec {
                goal,
                bmbox_prefix: prefix,
                waypoints,
            })
        }
        TrialKind::Simple | TrialKind::Fleet => {
            if raw.goal.is_some() || raw.bmbox_prefix.is_some() {
                return Err(unsupported("goal and bmbox_prefix apply to external trials only"));
            }
            None
        }
    };

    Ok(BenchmarkDescriptor {
        name,
        desc,
        code,
        timeout,
        total_timeout,
        kind: raw.kind,
        device_control: raw.device_control,
        external,
        scoring: raw.scoring,
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_yaml<T: serde::de::DeserializeOwned>(text: &str, path: &Path) -> Result<T, ConfigError> {
    if text.trim().is_empty() {
        return Err(ConfigError::ParseError {
            path: path.to_path_buf(),
            line: None,
            message: "document is empty".to_string(),
        });
    }
    serde_yaml::from_str(text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        line: e.location().map(|l| l.line()),
        message: e.to_string(),
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map_or_else(PathBuf::new, Path::to_path_buf)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Parses an environment variable with a default value.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================
