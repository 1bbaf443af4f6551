//! Configuration module
//!
//! Settings, benchmark catalog, team passwords, waypoint documents, and the
//! trial schedule resolved from them.

pub mod loader;
pub mod schema;

pub use loader::{ConfigLoader, LoadResult, LoadWarning, LoaderOptions, RsbbConfig};
pub use schema::{
    BenchmarkDescriptor, Catalog, ExternalSpec, GoalKind, Passwords, ScheduleEntry, ScoreKind,
    ScoringItem, Settings, TrialEvent, TrialKind, Waypoints,
};
