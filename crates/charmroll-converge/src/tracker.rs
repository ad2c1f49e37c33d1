//! Convergence decision state.
//!
//! Consecutive-success hysteresis, error-second accounting and progress
//! log throttling, advanced one observation at a time. Holds no clock:
//! every observation stands for one `wait_period` of elapsed time.

use std::time::Duration;

use tracing::debug;

use charmroll_core::{FleetSnapshot, WorkloadStatus};

use crate::policy::{ConvergencePolicy, Stability, WaitScope};

/// Outcome of feeding one observation to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Stability held for the required number of checks.
    Converged,
    /// Not there yet.
    Waiting,
    /// These applications used up the error budget.
    ErrorBudgetExhausted { applications: Vec<String> },
}

/// Tracks consecutive checks for one convergence wait.
#[derive(Debug)]
pub struct ConvergenceTracker {
    stability: Stability,
    required: u32,
    tick: Duration,
    log_every: Duration,
    error_timeout: Option<Duration>,
    consecutive_successes: u32,
    error_elapsed: Duration,
    since_log: Duration,
    checks: u64,
}

impl ConvergenceTracker {
    pub fn new(policy: &ConvergencePolicy) -> Self {
        Self {
            stability: policy.stability,
            required: policy.stability.required(),
            tick: policy.wait_period,
            log_every: policy.log_every,
            error_timeout: policy.effective_error_timeout(),
            consecutive_successes: 0,
            error_elapsed: Duration::ZERO,
            since_log: Duration::ZERO,
            checks: 0,
        }
    }

    /// Record a snapshot.
    pub fn observe(&mut self, snapshot: &FleetSnapshot, scope: &WaitScope) -> Progress {
        self.advance_clock();

        if let Some(budget) = self.error_timeout {
            let erroring = erroring_applications(snapshot, scope);
            if erroring.is_empty() {
                self.error_elapsed = Duration::ZERO;
            } else {
                self.error_elapsed += self.tick;
                debug!(
                    elapsed = ?self.error_elapsed,
                    budget = ?budget,
                    applications = ?erroring,
                    "applications in error"
                );
                if self.error_elapsed >= budget {
                    return Progress::ErrorBudgetExhausted {
                        applications: erroring,
                    };
                }
            }
        }

        if self.stability.holds(snapshot, scope) {
            self.consecutive_successes += 1;
        } else {
            self.consecutive_successes = 0;
        }

        if self.consecutive_successes >= self.required {
            Progress::Converged
        } else {
            Progress::Waiting
        }
    }

    /// Record a check whose status read failed. Counts against stability.
    pub fn observe_failure(&mut self) {
        self.advance_clock();
        self.consecutive_successes = 0;
    }

    /// Whether a progress line is due. Resets the throttle when it is.
    pub fn log_due(&mut self) -> bool {
        if self.since_log >= self.log_every {
            self.since_log = Duration::ZERO;
            true
        } else {
            false
        }
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Time applications have been observed in error without a break.
    pub fn error_elapsed(&self) -> Duration {
        self.error_elapsed
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }

    fn advance_clock(&mut self) {
        self.checks += 1;
        self.since_log += self.tick;
    }
}

/// Applications in scope reporting `error` themselves or on any unit.
fn erroring_applications(snapshot: &FleetSnapshot, scope: &WaitScope) -> Vec<String> {
    scope
        .select(snapshot)
        .filter(|app| {
            app.status == WorkloadStatus::Error
                || app.units.iter().any(|u| u.workload_status == WorkloadStatus::Error)
        })
        .map(|app| app.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use charmroll_core::{ApplicationStatus, UnitStatus};

    fn fleet(status: WorkloadStatus) -> FleetSnapshot {
        FleetSnapshot {
            applications: vec![
                ApplicationStatus::new("keystone", "cs:keystone-1")
                    .with_unit(UnitStatus::new("keystone/0", WorkloadStatus::Active))
                    .with_unit(UnitStatus::new("keystone/1", status)),
            ],
            machines: Vec::new(),
        }
    }

    fn fleet_policy() -> ConvergencePolicy {
        ConvergencePolicy::fleet().with_error_timeout(Duration::from_secs(20))
    }

    #[test]
    fn settled_fleet_converges_after_required_checks() {
        let mut tracker = ConvergenceTracker::new(&fleet_policy());
        let settled = fleet(WorkloadStatus::Active);

        assert_eq!(tracker.observe(&settled, &WaitScope::Fleet), Progress::Waiting);
        assert_eq!(tracker.observe(&settled, &WaitScope::Fleet), Progress::Waiting);
        assert_eq!(tracker.observe(&settled, &WaitScope::Fleet), Progress::Converged);
        assert_eq!(tracker.checks(), 3);
    }

    #[test]
    fn single_flaky_check_resets_hysteresis() {
        let mut tracker = ConvergenceTracker::new(&fleet_policy());
        let settled = fleet(WorkloadStatus::Active);
        let busy = fleet(WorkloadStatus::Maintenance);

        tracker.observe(&settled, &WaitScope::Fleet);
        tracker.observe(&settled, &WaitScope::Fleet);
        tracker.observe(&busy, &WaitScope::Fleet);
        assert_eq!(tracker.consecutive_successes(), 0);

        tracker.observe(&settled, &WaitScope::Fleet);
        tracker.observe(&settled, &WaitScope::Fleet);
        assert_eq!(tracker.observe(&settled, &WaitScope::Fleet), Progress::Converged);
    }

    #[test]
    fn failed_read_resets_hysteresis() {
        let mut tracker = ConvergenceTracker::new(&fleet_policy());
        let settled = fleet(WorkloadStatus::Active);

        tracker.observe(&settled, &WaitScope::Fleet);
        tracker.observe(&settled, &WaitScope::Fleet);
        tracker.observe_failure();
        assert_eq!(tracker.consecutive_successes(), 0);
    }

    #[test]
    fn persistent_error_exhausts_budget() {
        let mut tracker = ConvergenceTracker::new(&fleet_policy());
        let broken = fleet(WorkloadStatus::Error);

        // 2s per check against a 20s budget.
        for _ in 0..9 {
            assert_eq!(tracker.observe(&broken, &WaitScope::Fleet), Progress::Waiting);
        }
        assert_eq!(
            tracker.observe(&broken, &WaitScope::Fleet),
            Progress::ErrorBudgetExhausted {
                applications: vec!["keystone".to_string()]
            }
        );
    }

    #[test]
    fn recovery_resets_error_seconds() {
        let mut tracker = ConvergenceTracker::new(&fleet_policy());
        let broken = fleet(WorkloadStatus::Error);
        let busy = fleet(WorkloadStatus::Maintenance);

        for _ in 0..5 {
            tracker.observe(&broken, &WaitScope::Fleet);
        }
        assert_eq!(tracker.error_elapsed(), Duration::from_secs(10));

        tracker.observe(&busy, &WaitScope::Fleet);
        assert_eq!(tracker.error_elapsed(), Duration::ZERO);
    }

    #[test]
    fn errors_outside_scope_are_ignored() {
        let mut tracker = ConvergenceTracker::new(&fleet_policy());
        let scope = WaitScope::applications(["glance"]);
        for _ in 0..50 {
            let progress = tracker.observe(&fleet(WorkloadStatus::Error), &scope);
            assert!(!matches!(progress, Progress::ErrorBudgetExhausted { .. }));
        }
        assert_eq!(tracker.error_elapsed(), Duration::ZERO);
    }

    #[test]
    fn simple_policy_never_escalates_errors() {
        let mut tracker = ConvergenceTracker::new(&ConvergencePolicy::simple());
        for _ in 0..1000 {
            assert_eq!(
                tracker.observe(&fleet(WorkloadStatus::Error), &WaitScope::Fleet),
                Progress::Waiting
            );
        }
    }

    #[test]
    fn progress_lines_are_throttled() {
        // 0.5s per check, one line every 10s.
        let mut tracker = ConvergenceTracker::new(&ConvergencePolicy::simple());
        let busy = fleet(WorkloadStatus::Waiting);

        let mut lines = 0;
        for _ in 0..60 {
            tracker.observe(&busy, &WaitScope::Fleet);
            if tracker.log_due() {
                lines += 1;
            }
        }
        assert_eq!(lines, 3);
    }
}
