//! What to wait for and how patiently.

use std::time::Duration;

use charmroll_core::{ApplicationStatus, FleetSnapshot};

/// Error budgets shorter than this are raised to it.
pub const ERROR_TIMEOUT_FLOOR: Duration = Duration::from_secs(20);

/// Which applications a wait looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WaitScope {
    /// Every application in the model.
    #[default]
    Fleet,
    /// Only the named applications. Names absent from the model are ignored.
    Applications(Vec<String>),
}

impl WaitScope {
    pub fn applications(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        WaitScope::Applications(names.into_iter().map(Into::into).collect())
    }

    /// Applications of `snapshot` inside this scope.
    pub fn select<'a>(&'a self, snapshot: &'a FleetSnapshot) -> impl Iterator<Item = &'a ApplicationStatus> {
        snapshot.applications.iter().filter(move |app| match self {
            WaitScope::Fleet => true,
            WaitScope::Applications(names) => names.iter().any(|n| *n == app.name),
        })
    }
}

/// Predicate a snapshot must satisfy to count as a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// No unit in scope is in a blockable state, observed `required`
    /// times in a row.
    Settled { required: u32 },
    /// The model has no applications and no machines left.
    Drained,
}

impl Stability {
    pub fn holds(&self, snapshot: &FleetSnapshot, scope: &WaitScope) -> bool {
        match self {
            Stability::Settled { .. } => !scope.select(snapshot).any(ApplicationStatus::has_blockable_unit),
            Stability::Drained => snapshot.is_drained(),
        }
    }

    /// Consecutive successful checks needed to converge.
    pub fn required(&self) -> u32 {
        match self {
            Stability::Settled { required } => (*required).max(1),
            Stability::Drained => 1,
        }
    }
}

/// Timing and predicate of one convergence wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergencePolicy {
    pub stability: Stability,
    /// Sleep between checks.
    pub wait_period: Duration,
    /// Accumulated wait between two progress lines.
    pub log_every: Duration,
    /// Sleep before the first check.
    pub initial_delay: Duration,
    /// Abort once an application has been in `error` this long.
    pub error_timeout: Option<Duration>,
    /// Overall limit on the poll loop, not counting the initial delay.
    pub deadline: Option<Duration>,
}

impl ConvergencePolicy {
    /// One clean check is enough. Used after deploys and charm upgrades
    /// of a known application set.
    pub fn simple() -> Self {
        Self {
            stability: Stability::Settled { required: 1 },
            wait_period: Duration::from_millis(500),
            log_every: Duration::from_secs(10),
            initial_delay: Duration::from_secs(2),
            error_timeout: None,
            deadline: None,
        }
    }

    /// Three clean checks two seconds apart, with a five minute error
    /// budget. Used between upgrade steps.
    pub fn fleet() -> Self {
        Self {
            stability: Stability::Settled { required: 3 },
            wait_period: Duration::from_secs(2),
            log_every: Duration::from_secs(10),
            initial_delay: Duration::from_secs(2),
            error_timeout: Some(Duration::from_secs(300)),
            deadline: None,
        }
    }

    /// Wait for an empty model.
    pub fn drained() -> Self {
        Self {
            stability: Stability::Drained,
            log_every: Duration::from_secs(5),
            ..Self::simple()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_error_timeout(mut self, budget: Duration) -> Self {
        self.error_timeout = Some(budget);
        self
    }

    /// Error budget after applying [`ERROR_TIMEOUT_FLOOR`].
    pub fn effective_error_timeout(&self) -> Option<Duration> {
        self.error_timeout.map(|t| t.max(ERROR_TIMEOUT_FLOOR))
    }
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self::simple()
    }
}
