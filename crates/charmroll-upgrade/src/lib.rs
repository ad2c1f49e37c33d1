//! charmroll-upgrade — the upgrade orchestration engine.
//!
//! # Components
//!
//! - **`revision`** — resolve target charm revisions and upgrade charms
//! - **`rollable`** — capability negotiation and rollability classification
//! - **`sequencer`** — leader-first unit order and HA subordinate pairing
//! - **`strategy`** — rolling (per unit) and bulk (config change) upgrades
//! - **`orchestrator`** — sequences the phases across the whole plan
//!
//! Every wait between disruptive steps goes through
//! [`charmroll_converge::wait_until`].

pub mod error;
pub mod orchestrator;
pub mod revision;
pub mod rollable;
pub mod sequencer;
pub mod strategy;
pub mod timings;

pub use error::{UpgradeError, UpgradeResult};
pub use orchestrator::{AppUpgrade, Orchestrator, UpgradeReport};
pub use revision::{RevisionOutcome, RevisionTarget, upgrade_revisions};
pub use rollable::{Capabilities, is_rollable};
pub use sequencer::{Leadership, hacluster_pairs, order_units};
pub use strategy::{StrategyExecutor, StrategyUsed};
pub use timings::Timings;
