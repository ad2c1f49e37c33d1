//! Delays, poll budgets and timeouts used by the upgrade engine.

use std::time::Duration;

use charmroll_converge::ConvergencePolicy;

/// Every timing constant of an upgrade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// Pause after each charm upgrade.
    pub charm_settle: Duration,
    /// Pause before converging after the revision phase.
    pub post_revision_settle: Duration,
    /// Pause before collecting final unit statuses.
    pub collect_delay: Duration,
    /// Pause after adding the storage access relation.
    pub relation_settle: Duration,
    pub config_poll_interval: Duration,
    pub config_poll_attempts: u32,
    /// Pause after a bulk origin change.
    pub bulk_settle: Duration,
    pub bulk_poll_interval: Duration,
    /// Limit on pause and resume actions.
    pub pause_timeout: Duration,
    /// Limit on the per-unit upgrade action and on a bulk upgrade.
    pub upgrade_timeout: Duration,
    /// Limit on every fleet convergence wait.
    pub convergence_deadline: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            charm_settle: Duration::from_secs(30),
            post_revision_settle: Duration::from_secs(20),
            collect_delay: Duration::from_secs(20),
            relation_settle: Duration::from_secs(120),
            config_poll_interval: Duration::from_secs(5),
            config_poll_attempts: 60,
            bulk_settle: Duration::from_secs(15),
            bulk_poll_interval: Duration::from_secs(5),
            pause_timeout: Duration::from_secs(300),
            upgrade_timeout: Duration::from_secs(1800),
            convergence_deadline: Duration::from_secs(1800),
        }
    }
}

impl Timings {
    /// Wait used between upgrade steps.
    pub fn fleet_wait(&self) -> ConvergencePolicy {
        ConvergencePolicy::fleet().with_deadline(self.convergence_deadline)
    }

    /// Wait used after charm upgrades and relation changes.
    pub fn settle_wait(&self) -> ConvergencePolicy {
        ConvergencePolicy::simple().with_deadline(self.convergence_deadline)
    }
}
