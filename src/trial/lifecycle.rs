//! Phase/state machine shared by every trial kind.
//!
//! A trial moves `Pre → Exec → Post`; while in `Exec` its
//! [`BenchmarkState`] cycles from `Prepare` onwards. The [`Benchmark`] trait
//! supplies the transitions every kind shares (start, stop, timeout,
//! snapshot) on top of per-kind hooks.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info};

use crate::bus::{Bus, TIMEOUT_TOPIC};
use crate::config::{ScoringItem, TrialEvent};
use crate::display::DisplayText;
use crate::messages::BenchmarkState;
use crate::observability::metrics::{self, TimeoutTier};
use crate::observability::{RunLog, TrialIdentity};
use crate::shared::SharedState;
use crate::timing::{ElapsedTimer, format_countdown, signed_difference};

use super::status::{StatusView, group_scoring};

/// Callback run once when a trial terminates itself.
pub type EndHook = Box<dyn FnOnce() + Send>;

/// Coarse trial stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not started yet
    Pre,
    /// Running
    Exec,
    /// Stopped
    Post,
}

impl Phase {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Exec => "exec",
            Self::Post => "post",
        }
    }
}

/// State common to all trial kinds.
pub struct Lifecycle {
    pub(super) zone: String,
    pub(super) event: TrialEvent,
    pub(super) phase: Phase,
    pub(super) state: BenchmarkState,
    pub(super) timed_out: bool,
    pub(super) timer: ElapsedTimer,
    pub(super) last_stop: Option<Instant>,
    pub(super) state_desc: String,
    pub(super) state_time: Instant,
    pub(super) manual_operation: String,
    pub(super) log: RunLog,
    pub(super) online: DisplayText,
    pub(super) scoring: Vec<ScoringItem>,
    pub(super) bus: Arc<dyn Bus>,
    terminated: bool,
    on_end: Option<EndHook>,
    after_stop: Duration,
    status_lines: usize,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("zone", &self.zone)
            .field("phase", &self.phase)
            .field("state", &self.state)
            .field("state_desc", &self.state_desc)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Creates a lifecycle in `Pre`/`Stop` with a fresh copy of the
    /// benchmark's scoring table.
    #[must_use]
    pub fn new(
        zone: String,
        event: TrialEvent,
        shared: &SharedState,
        bus: Arc<dyn Bus>,
        on_end: EndHook,
        now: Instant,
    ) -> Self {
        let settings = shared.settings();
        let identity = TrialIdentity {
            team: event.team.clone(),
            round: event.round,
            run: event.run,
            benchmark: event.benchmark.code.clone(),
            run_uuid: shared.run_uuid(),
        };
        let log = RunLog::open(
            settings.log_dir.as_deref(),
            identity,
            settings.display_log_size,
        );

        let mut lifecycle = Self {
            zone,
            phase: Phase::Pre,
            state: BenchmarkState::Stop,
            timed_out: false,
            timer: ElapsedTimer::new(event.benchmark.timeout),
            last_stop: None,
            state_desc: String::new(),
            state_time: now,
            manual_operation: String::new(),
            log,
            online: DisplayText::new(settings.display_log_size),
            scoring: event.benchmark.scoring.clone(),
            bus,
            terminated: false,
            on_end: Some(on_end),
            after_stop: settings.after_stop_duration,
            status_lines: settings.status_log_lines,
            event,
        };
        lifecycle.set_state(now, BenchmarkState::Stop, "All OK for start");
        lifecycle
    }

    /// Zone identifier.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Event being run.
    #[must_use]
    pub const fn event(&self) -> &TrialEvent {
        &self.event
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Current benchmark state.
    #[must_use]
    pub const fn state(&self) -> BenchmarkState {
        self.state
    }

    /// Current status description.
    #[must_use]
    pub fn state_desc(&self) -> &str {
        &self.state_desc
    }

    /// When the current state was entered.
    #[must_use]
    pub const fn state_time(&self) -> Instant {
        self.state_time
    }

    /// Whether the last stop was caused by the timer.
    #[must_use]
    pub const fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Whether the trial ended itself.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Current scoring table.
    #[must_use]
    pub fn scoring(&self) -> &[ScoringItem] {
        &self.scoring
    }

    /// Sets state and description, timestamped and audited.
    pub fn set_state(&mut self, now: Instant, state: BenchmarkState, desc: &str) {
        self.state = state;
        self.state_desc = desc.to_string();
        self.state_time = now;
        self.log.state_change(state, desc);
        info!(zone = %self.zone, %state, desc, "benchmark state");
    }

    /// Replaces the description while keeping the state.
    pub fn set_desc(&mut self, now: Instant, desc: &str) {
        self.set_state(now, self.state, desc);
    }

    pub(super) fn enter_exec(&mut self, now: Instant, desc: &str) {
        if self.phase == Phase::Pre {
            self.timer.start_reset(now, None);
        } else {
            self.timer.resume_hot(now);
        }
        self.phase = Phase::Exec;
        self.timed_out = false;
        self.set_state(now, BenchmarkState::Prepare, desc);
        metrics::record_phase_transition(Phase::Exec.as_str());
    }

    pub(super) fn enter_post(&mut self, now: Instant, desc: &str) {
        info!(zone = %self.zone, reason = desc, "trial stopped");
        self.phase = Phase::Post;
        self.last_stop = Some(now);
        self.set_state(now, BenchmarkState::Stop, desc);
        self.timer.stop_pause(now);
        metrics::record_phase_transition(Phase::Post.as_str());
    }

    /// Updates the scoring item matching `group` and `desc`. Unmatched
    /// updates are logged and dropped.
    pub fn record_score(&mut self, group: &str, desc: &str, value: i64) -> bool {
        let matched = match self
            .scoring
            .iter_mut()
            .find(|item| item.group == group && item.desc == desc)
        {
            Some(item) => {
                item.current_value = value;
                self.log.score(group, desc, value);
                true
            }
            None => {
                error!(zone = %self.zone, group, desc, "Did not find scoring item");
                false
            }
        };
        metrics::record_score(matched);
        matched
    }

    fn publish_timeout(&self) {
        self.bus.publish(TIMEOUT_TOPIC, serde_json::json!({ "zone": self.zone }));
    }

    fn fire_end(&mut self) {
        self.terminated = true;
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }

    /// Status fields every kind shares.
    #[must_use]
    pub fn base_status(&self, now: Instant) -> StatusView {
        let timer = match self.phase {
            Phase::Pre => signed_difference(self.event.benchmark.timeout, Duration::ZERO),
            Phase::Exec => self.timer.until_timeout(now),
            Phase::Post => self.last_stop.map_or(TimeDelta::zero(), |stopped| {
                signed_difference(self.after_stop, now.saturating_duration_since(stopped))
            }),
        };
        let start_enabled = self.state == BenchmarkState::Stop;
        StatusView {
            zone: self.zone.clone(),
            team: self.event.team.clone(),
            benchmark: self.event.benchmark.code.clone(),
            phase: self.phase,
            benchmark_state: self.state,
            timer,
            countdown: format_countdown(timer),
            state: self.state_desc.clone(),
            manual_operation: self.manual_operation.clone(),
            start_enabled,
            stop_enabled: !start_enabled,
            log: self.log.display().last(self.status_lines),
            online_data: self.online.last(self.status_lines),
            scoring: group_scoring(&self.scoring),
            omf: None,
        }
    }

    /// Writes the closing audit record.
    pub fn finish(&mut self) {
        self.log.end();
    }
}

// ============================================================================
// Shared behaviour
// ============================================================================

/// Per-kind hooks plus the transitions all kinds share.
pub(crate) trait Benchmark {
    fn lifecycle(&self) -> &Lifecycle;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle;

    /// Runs after the lifecycle entered `Exec`.
    fn on_enter_exec(&mut self, _now: Instant) {}

    /// Runs after the lifecycle entered `Post`.
    fn on_enter_post(&mut self, _now: Instant) {}

    /// Adds kind-specific lines to a snapshot.
    fn on_fill_status(&self, _now: Instant, _view: &mut StatusView) {}

    /// Closes channels and releases robot claims.
    fn stop_communication(&mut self);

    /// Tier reported when the armed timeout expires.
    fn timeout_tier(&self) -> TimeoutTier {
        TimeoutTier::Trial
    }

    fn phase_exec(&mut self, now: Instant, desc: &str) {
        self.lifecycle_mut().enter_exec(now, desc);
        self.on_enter_exec(now);
    }

    fn phase_post(&mut self, now: Instant, desc: &str) {
        self.lifecycle_mut().enter_post(now, desc);
        self.on_enter_post(now);
    }

    /// Starts the trial; ignored unless the state is `Stop`.
    fn start(&mut self, now: Instant) {
        let lifecycle = self.lifecycle();
        if lifecycle.state == BenchmarkState::Stop && !lifecycle.terminated {
            self.phase_exec(now, "Robot preparing for task");
        }
    }

    /// Stops a running trial, or terminates one that is already stopped.
    fn stop(&mut self, now: Instant) {
        if self.lifecycle().terminated {
            return;
        }
        if self.lifecycle().state == BenchmarkState::Stop {
            self.terminate(now);
        } else {
            self.phase_post(now, "Benchmark Stopped by referee");
        }
    }

    /// Ends the trial for good.
    fn terminate(&mut self, now: Instant) {
        self.lifecycle_mut().timer.stop_pause(now);
        self.stop_communication();
        self.lifecycle_mut().fire_end();
    }

    /// Fires the timeout if its deadline passed.
    fn poll_timers(&mut self, now: Instant) {
        if !self.lifecycle_mut().timer.poll_timeout(now) || self.lifecycle().phase != Phase::Exec {
            return;
        }
        let tier = self.timeout_tier();
        info!(zone = %self.lifecycle().zone, ?tier, "trial timed out");
        metrics::record_timeout(tier);
        self.lifecycle_mut().timed_out = true;
        self.phase_post(now, "Stopped due to timeout!");
        self.lifecycle().publish_timeout();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lifecycle().timer.deadline()
    }

    fn snapshot(&self, now: Instant) -> StatusView {
        let mut view = self.lifecycle().base_status(now);
        self.on_fill_status(now, &mut view);
        view
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::{BenchmarkDescriptor, Passwords, ScoreKind, Settings, TrialKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn descriptor(kind: TrialKind, timeout: Duration) -> Arc<BenchmarkDescriptor> {
        Arc::new(BenchmarkDescriptor {
            name: "Test".to_string(),
            desc: "Test benchmark".to_string(),
            code: "TST".to_string(),
            timeout,
            total_timeout: timeout,
            kind,
            device_control: false,
            external: None,
            scoring: vec![
                ScoringItem {
                    group: "Achievements".to_string(),
                    desc: "Reached".to_string(),
                    kind: ScoreKind::Bool,
                    current_value: 0,
                },
                ScoringItem {
                    group: "Penalties".to_string(),
                    desc: "Bumps".to_string(),
                    kind: ScoreKind::Uint,
                    current_value: 0,
                },
            ],
        })
    }

    pub(crate) fn event(benchmark: Arc<BenchmarkDescriptor>) -> TrialEvent {
        TrialEvent {
            team: "alpha".to_string(),
            round: 1,
            run: 1,
            robot: None,
            benchmark,
            password: "secret".to_string(),
        }
    }

    pub(crate) fn shared() -> SharedState {
        SharedState::new(Settings::default(), Passwords::default())
    }

    #[derive(Debug)]
    struct Bare {
        lifecycle: Lifecycle,
        stopped: usize,
    }

    impl Benchmark for Bare {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }

        fn lifecycle_mut(&mut self) -> &mut Lifecycle {
            &mut self.lifecycle
        }

        fn stop_communication(&mut self) {
            self.stopped += 1;
        }
    }

    fn bare(ends: Arc<AtomicUsize>) -> (Bare, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let lifecycle = Lifecycle::new(
            "zone".to_string(),
            event(descriptor(TrialKind::Simple, Duration::from_secs(60))),
            &shared(),
            bus.clone(),
            Box::new(move || {
                ends.fetch_add(1, Ordering::SeqCst);
            }),
            Instant::now(),
        );
        (
            Bare {
                lifecycle,
                stopped: 0,
            },
            bus,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_only_from_stop() {
        let (mut trial, _bus) = bare(Arc::default());
        let now = Instant::now();
        trial.start(now);
        assert_eq!(trial.lifecycle.phase(), Phase::Exec);
        assert_eq!(trial.lifecycle.state(), BenchmarkState::Prepare);

        trial.lifecycle.set_state(now, BenchmarkState::WaitingResult, "busy");
        trial.start(now);
        assert_eq!(trial.lifecycle.state(), BenchmarkState::WaitingResult);
        assert_eq!(trial.lifecycle.state_desc(), "busy");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_running_enters_post_then_terminates() {
        let ends = Arc::new(AtomicUsize::new(0));
        let (mut trial, _bus) = bare(Arc::clone(&ends));
        let now = Instant::now();
        trial.start(now);
        trial.stop(now);
        assert_eq!(trial.lifecycle.phase(), Phase::Post);
        assert_eq!(trial.lifecycle.state_desc(), "Benchmark Stopped by referee");
        assert!(!trial.lifecycle.is_terminated());

        trial.stop(now);
        assert!(trial.lifecycle.is_terminated());
        assert_eq!(trial.stopped, 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);

        trial.stop(now);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_once_and_publishes() {
        let (mut trial, bus) = bare(Arc::default());
        let start = Instant::now();
        trial.start(start);
        let deadline = trial.next_deadline().unwrap();
        assert_eq!(deadline, start + Duration::from_secs(60));

        trial.poll_timers(deadline - Duration::from_millis(1));
        assert_eq!(trial.lifecycle.phase(), Phase::Exec);

        trial.poll_timers(deadline);
        assert_eq!(trial.lifecycle.phase(), Phase::Post);
        assert!(trial.lifecycle.timed_out());
        assert_eq!(trial.lifecycle.state_desc(), "Stopped due to timeout!");
        assert!(bus.latest(TIMEOUT_TOPIC).is_some());
        assert!(trial.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn score_updates_matching_item_only() {
        let (mut trial, _bus) = bare(Arc::default());
        assert!(trial.lifecycle.record_score("Penalties", "Bumps", 3));
        assert!(!trial.lifecycle.record_score("Penalties", "Nope", 1));
        assert_eq!(trial.lifecycle.scoring()[1].current_value, 3);
        assert_eq!(trial.lifecycle.scoring()[0].current_value, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_timer_follows_phase() {
        let (mut trial, _bus) = bare(Arc::default());
        let start = Instant::now();
        let view = trial.snapshot(start);
        assert_eq!(view.timer, TimeDelta::seconds(60));
        assert!(view.start_enabled);
        assert_eq!(view.scoring.len(), 2);

        trial.start(start);
        let view = trial.snapshot(start + Duration::from_secs(15));
        assert_eq!(view.timer, TimeDelta::seconds(45));
        assert_eq!(view.countdown, "00:45");
        assert!(view.stop_enabled);

        let stopped = start + Duration::from_secs(20);
        trial.stop(stopped);
        let view = trial.snapshot(stopped + Duration::from_secs(20));
        assert_eq!(view.timer, TimeDelta::seconds(100));
        assert!(view.log.iter().any(|line| line.contains("Benchmark Stopped by referee")));
    }
}
