//! Metrics collection for `rsbb`.
//!
//! Prometheus-compatible metrics with typed convenience functions. Label
//! values are drawn from closed sets so cardinality stays bounded.

use std::sync::atomic::{AtomicBool, Ordering};

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::RsbbError;

/// Guard to prevent double-initialization of the metrics recorder.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Which timeout tier expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTier {
    /// Single-budget trial timeout
    Trial,
    /// Sub-goal expiry with session budget left
    Partial,
    /// Session budget exhausted
    Total,
}

impl TimeoutTier {
    const fn label(self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Partial => "partial",
            Self::Total => "total",
        }
    }
}

/// Initializes the global metrics recorder.
///
/// When `port` is `Some`, a Prometheus HTTP listener is started on
/// `127.0.0.1:<port>`. When `None`, the recorder is installed without an
/// HTTP endpoint.
///
/// # Errors
///
/// Returns `RsbbError::Io` if the recorder or HTTP listener cannot be
/// installed (e.g. port already in use).
pub fn init_metrics(port: Option<u16>) -> Result<(), RsbbError> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| RsbbError::Io(std::io::Error::other(e.to_string())))?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "rsbb_heartbeats_total",
        "Robot heartbeats and beacons received"
    );
    describe_counter!("rsbb_trials_started_total", "Trial zones connected");
    describe_counter!(
        "rsbb_phase_transitions_total",
        "Trial phase transitions"
    );
    describe_counter!("rsbb_timeouts_total", "Trial timeouts by tier");
    describe_counter!(
        "rsbb_channel_open_failures_total",
        "Private channel allocations that failed and were retried"
    );
    describe_counter!("rsbb_scores_total", "Score updates received");
    describe_counter!(
        "rsbb_peer_controller_messages_total",
        "Benchmark state messages received from another referee box"
    );
    describe_gauge!("rsbb_active_robots", "Robots currently present");
    describe_gauge!("rsbb_zones_active", "Trial zones currently open");
}

/// Records a heartbeat on a private channel or a public beacon.
pub fn record_heartbeat(private: bool) {
    let source = if private { "private" } else { "beacon" };
    counter!("rsbb_heartbeats_total", "source" => source).increment(1);
}

/// Records a newly connected trial zone.
pub fn record_trial_started(kind: &'static str) {
    counter!("rsbb_trials_started_total", "kind" => kind).increment(1);
}

/// Records a phase transition.
pub fn record_phase_transition(phase: &'static str) {
    counter!("rsbb_phase_transitions_total", "phase" => phase).increment(1);
}

/// Records an expired timeout.
pub fn record_timeout(tier: TimeoutTier) {
    counter!("rsbb_timeouts_total", "tier" => tier.label()).increment(1);
}

/// Records a failed private channel allocation.
pub fn record_channel_open_failure() {
    counter!("rsbb_channel_open_failures_total").increment(1);
}

/// Records a score update and whether it matched a scoring item.
pub fn record_score(matched: bool) {
    let outcome = if matched { "matched" } else { "unmatched" };
    counter!("rsbb_scores_total", "outcome" => outcome).increment(1);
}

/// Records a message from a conflicting referee box.
pub fn record_peer_controller() {
    counter!("rsbb_peer_controller_messages_total").increment(1);
}

/// Sets the present-robot gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_robots(count: usize) {
    gauge!("rsbb_active_robots").set(count as f64);
}

/// Sets the open-zone gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_zones_active(count: usize) {
    gauge!("rsbb_zones_active").set(count as f64);
}
