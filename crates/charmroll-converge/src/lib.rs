//! charmroll-converge — wait until a fleet settles.
//!
//! The monitor polls fleet status through a [`ClusterClient`] until a
//! stability predicate holds, the connection drops, the deadline passes,
//! or an application stays in `error` for longer than its budget.
//!
//! # Architecture
//!
//! ```text
//! wait_until(client, scope, policy)
//!   ├── initial delay
//!   └── poll loop (under the policy deadline)
//!       ├── is_connected()?  → ConnectionClosed
//!       ├── status()         → FleetSnapshot
//!       └── ConvergenceTracker::observe(snapshot)
//!           ├── Converged            → [DONE] summary
//!           ├── Waiting              → [WAITING] every log period
//!           └── ErrorBudgetExhausted → [ERROR] diagnostics
//! ```
//!
//! All counters live in [`ConvergenceTracker`], so the decision logic is
//! testable by feeding it snapshot sequences directly.
//!
//! [`ClusterClient`]: charmroll_client::ClusterClient

pub mod error;
pub mod monitor;
pub mod policy;
pub mod tracker;

pub use error::{ConvergeError, ConvergeResult};
pub use monitor::wait_until;
pub use policy::{ConvergencePolicy, ERROR_TIMEOUT_FLOOR, Stability, WaitScope};
pub use tracker::{ConvergenceTracker, Progress};
