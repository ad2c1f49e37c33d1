//! charmroll-core — data model shared by every charmroll crate.
//!
//! - **`types`** — status snapshots of applications, units, machines
//! - **`charm`** — total charm reference parser
//! - **`settings`** — optional settings file and built-in defaults
//! - **`plan`** — resolved upgrade plan and operator options

pub mod charm;
pub mod plan;
pub mod settings;
pub mod types;

pub use charm::{CharmRef, CharmSource};
pub use plan::{UpgradeAction, UpgradeOptions, UpgradePlan};
pub use settings::UpgradeSettings;
pub use types::*;
