//! Observability module
//!
//! Logging, metrics, and the per-trial audit log.

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{AuditRecord, RunLog, TrialIdentity};
pub use logging::{LogFormat, init_logging};
pub use metrics::init_metrics;
