//! Elapsed-time controller for trial timeouts.
//!
//! [`ElapsedTimer`] measures accumulated running time across pauses and fires
//! a single timeout once that time reaches the current budget. It never spawns
//! anything itself: every operation takes an explicit `now`, and the owning
//! trial task sleeps until [`ElapsedTimer::deadline`] and then calls
//! [`ElapsedTimer::poll_timeout`].

use std::time::Duration;

use chrono::TimeDelta;
use tokio::time::Instant;

/// Pausable countdown with a one-shot timeout notification.
#[derive(Debug, Clone)]
pub struct ElapsedTimer {
    default_timeout: Duration,
    timeout: Duration,
    accumulated: Duration,
    running_since: Option<Instant>,
    fired: bool,
}

impl ElapsedTimer {
    /// Creates a stopped timer whose budget defaults to `default_timeout`.
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            timeout: default_timeout,
            accumulated: Duration::ZERO,
            running_since: None,
            fired: false,
        }
    }

    /// Zeroes the accumulated time, installs a budget and starts running.
    ///
    /// `None` restores the default budget. Re-arms the timeout notification.
    pub fn start_reset(&mut self, now: Instant, timeout: Option<Duration>) {
        self.timeout = timeout.unwrap_or(self.default_timeout);
        self.accumulated = Duration::ZERO;
        self.running_since = Some(now);
        self.fired = false;
    }

    /// Stops running, folding the current run into the accumulated time.
    pub fn stop_pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    /// Continues running without touching the accumulated time.
    ///
    /// A timeout that already fired stays silent; use
    /// [`resume_hot`](Self::resume_hot) to re-arm it.
    pub fn resume(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// Continues running and re-arms the timeout notification.
    ///
    /// If the budget is already used up the timeout fires on the next poll.
    pub fn resume_hot(&mut self, now: Instant) {
        self.resume(now);
        self.fired = false;
    }

    /// Accumulated running time including the current run.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.accumulated
            + self
                .running_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    /// Whether the timer is currently running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// The budget currently installed.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Signed time left in the current budget; negative once exceeded.
    #[must_use]
    pub fn until_timeout(&self, now: Instant) -> TimeDelta {
        signed_difference(self.timeout, self.elapsed(now))
    }

    /// Signed time left against an arbitrary budget.
    #[must_use]
    pub fn until_timeout_for(&self, now: Instant, budget: Duration) -> TimeDelta {
        signed_difference(budget, self.elapsed(now))
    }

    /// Instant at which the armed timeout fires, if the timer is running.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        if self.fired {
            return None;
        }
        let since = self.running_since?;
        Some(since + self.timeout.saturating_sub(self.accumulated))
    }

    /// Returns `true` exactly once when the running time reaches the budget.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.fired = true;
                true
            }
            _ => false,
        }
    }
}

/// `a - b` as a signed delta, saturating on overflow.
#[must_use]
pub fn signed_difference(a: Duration, b: Duration) -> TimeDelta {
    let a = TimeDelta::from_std(a).unwrap_or(TimeDelta::MAX);
    let b = TimeDelta::from_std(b).unwrap_or(TimeDelta::MAX);
    a.checked_sub(&b).unwrap_or(TimeDelta::MIN)
}

/// Formats a signed delta as `[-]MM:SS`, or `[-]H:MM:SS` past an hour.
#[must_use]
pub fn format_countdown(delta: TimeDelta) -> String {
    let sign = if delta < TimeDelta::zero() { "-" } else { "" };
    let total = delta.num_seconds().unsigned_abs();
    let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
    if hours > 0 {
        format!("{sign}{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{sign}{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn elapsed_is_additive_across_pauses() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(secs(60));
        timer.start_reset(t0, None);
        timer.stop_pause(t0 + secs(10));
        // paused for 100s
        timer.resume(t0 + secs(110));
        timer.stop_pause(t0 + secs(115));
        assert_eq!(timer.elapsed(t0 + secs(500)), secs(15));
    }

    #[test]
    fn timeout_fires_once() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(secs(60));
        timer.start_reset(t0, None);
        assert!(!timer.poll_timeout(t0 + secs(59)));
        assert!(timer.poll_timeout(t0 + secs(60)));
        assert!(!timer.poll_timeout(t0 + secs(61)));
        assert!(!timer.poll_timeout(t0 + secs(600)));
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn deadline_accounts_for_accumulated_time() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(secs(60));
        timer.start_reset(t0, None);
        timer.stop_pause(t0 + secs(20));
        assert_eq!(timer.deadline(), None);
        timer.resume(t0 + secs(50));
        assert_eq!(timer.deadline(), Some(t0 + secs(90)));
    }

    #[test]
    fn resume_hot_refires_exhausted_budget() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(secs(10));
        timer.start_reset(t0, None);
        assert!(timer.poll_timeout(t0 + secs(10)));
        timer.stop_pause(t0 + secs(12));

        timer.resume(t0 + secs(20));
        assert!(!timer.poll_timeout(t0 + secs(20)));

        timer.stop_pause(t0 + secs(21));
        timer.resume_hot(t0 + secs(30));
        assert!(timer.poll_timeout(t0 + secs(30)));
    }

    #[test]
    fn start_reset_installs_budget() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(secs(60));
        timer.start_reset(t0, Some(secs(5)));
        assert_eq!(timer.timeout(), secs(5));
        assert_eq!(timer.until_timeout(t0 + secs(7)), TimeDelta::seconds(-2));
        timer.start_reset(t0 + secs(7), None);
        assert_eq!(timer.timeout(), secs(60));
        assert_eq!(timer.elapsed(t0 + secs(7)), Duration::ZERO);
    }

    #[test]
    fn until_timeout_for_uses_given_budget() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(secs(60));
        timer.start_reset(t0, None);
        assert_eq!(
            timer.until_timeout_for(t0 + secs(30), secs(100)),
            TimeDelta::seconds(70)
        );
    }

    #[test]
    fn countdown_formatting() {
        assert_eq!(format_countdown(TimeDelta::seconds(75)), "01:15");
        assert_eq!(format_countdown(TimeDelta::seconds(-5)), "-00:05");
        assert_eq!(format_countdown(TimeDelta::seconds(3725)), "1:02:05");
    }
}
