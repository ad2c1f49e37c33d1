//! Snapshot types mirrored from the managed cluster.
//!
//! Nothing here is owned by charmroll: every value is a point-in-time
//! read of cluster state and is re-fetched on every poll.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Workload status reported by an application or a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Active,
    Waiting,
    Blocked,
    Maintenance,
    Error,
    Unknown,
}

impl WorkloadStatus {
    /// Statuses that mean "not converged yet".
    pub const BLOCKABLE: [WorkloadStatus; 4] = [
        WorkloadStatus::Maintenance,
        WorkloadStatus::Blocked,
        WorkloadStatus::Waiting,
        WorkloadStatus::Error,
    ];

    /// Parse the status string the controller reports. Anything
    /// unrecognised maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => WorkloadStatus::Active,
            "waiting" => WorkloadStatus::Waiting,
            "blocked" => WorkloadStatus::Blocked,
            "maintenance" => WorkloadStatus::Maintenance,
            "error" => WorkloadStatus::Error,
            _ => WorkloadStatus::Unknown,
        }
    }

    pub fn is_blockable(self) -> bool {
        Self::BLOCKABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadStatus::Active => "active",
            WorkloadStatus::Waiting => "waiting",
            WorkloadStatus::Blocked => "blocked",
            WorkloadStatus::Maintenance => "maintenance",
            WorkloadStatus::Error => "error",
            WorkloadStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running instance of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Conventionally `<application>/<index>`.
    pub name: String,
    pub workload_status: WorkloadStatus,
    pub workload_message: String,
    /// Used only to pair a unit with its co-located subordinate.
    pub public_address: Option<String>,
    pub machine: Option<String>,
}

impl UnitStatus {
    pub fn new(name: &str, workload_status: WorkloadStatus) -> Self {
        Self {
            name: name.to_string(),
            workload_status,
            workload_message: String::new(),
            public_address: None,
            machine: None,
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.public_address = Some(address.to_string());
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.workload_message = message.to_string();
        self
    }
}

/// A relation as seen from one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    /// Endpoint name on this application's side.
    pub endpoint: String,
    /// Interface provided over the relation.
    pub interface: String,
    /// Application on the other end.
    pub remote_application: String,
    /// The remote application is a subordinate of this one.
    pub subordinate: bool,
}

/// Point-in-time view of a deployed application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub name: String,
    pub status: WorkloadStatus,
    pub status_message: String,
    /// Charm URL as deployed, e.g. `cs:xenial/keystone-281`.
    pub charm_url: String,
    pub workload_version: Option<String>,
    pub units: Vec<UnitStatus>,
    pub relations: Vec<RelationInfo>,
}

impl ApplicationStatus {
    pub fn new(name: &str, charm_url: &str) -> Self {
        Self {
            name: name.to_string(),
            status: WorkloadStatus::Active,
            status_message: String::new(),
            charm_url: charm_url.to_string(),
            workload_version: None,
            units: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: UnitStatus) -> Self {
        self.units.push(unit);
        self
    }

    pub fn with_relation(mut self, relation: RelationInfo) -> Self {
        self.relations.push(relation);
        self
    }

    /// Any unit still in a blockable state.
    pub fn has_blockable_unit(&self) -> bool {
        self.units.iter().any(|u| u.workload_status.is_blockable())
    }
}

/// A machine in the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub id: String,
    /// Hardware characteristics were reported (the machine was provisioned).
    pub has_hardware: bool,
}

/// Everything a single status read returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub applications: Vec<ApplicationStatus>,
    pub machines: Vec<MachineStatus>,
}

impl FleetSnapshot {
    pub fn application(&self, name: &str) -> Option<&ApplicationStatus> {
        self.applications.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.application(name).is_some()
    }

    pub fn application_names(&self) -> Vec<String> {
        self.applications.iter().map(|a| a.name.clone()).collect()
    }

    pub fn is_drained(&self) -> bool {
        self.applications.is_empty() && self.machines.is_empty()
    }
}

/// Histogram of statuses across a set of applications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub applications: BTreeMap<WorkloadStatus, usize>,
    pub units: BTreeMap<WorkloadStatus, usize>,
}

impl StatusSummary {
    pub fn of<'a>(apps: impl IntoIterator<Item = &'a ApplicationStatus>) -> Self {
        let mut summary = Self::default();
        for app in apps {
            *summary.applications.entry(app.status).or_default() += 1;
            for unit in &app.units {
                *summary.units.entry(unit.workload_status).or_default() += 1;
            }
        }
        summary
    }
}

/// Completion state of a remote action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => ActionStatus::Completed,
            "failed" | "error" => ActionStatus::Failed,
            "cancelled" | "aborted" => ActionStatus::Cancelled,
            "running" => ActionStatus::Running,
            _ => ActionStatus::Pending,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ActionStatus::Completed
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of running a command on a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blockable_statuses() {
        assert!(WorkloadStatus::Maintenance.is_blockable());
        assert!(WorkloadStatus::Blocked.is_blockable());
        assert!(WorkloadStatus::Waiting.is_blockable());
        assert!(WorkloadStatus::Error.is_blockable());
        assert!(!WorkloadStatus::Active.is_blockable());
        assert!(!WorkloadStatus::Unknown.is_blockable());
    }

    #[test]
    fn parse_unrecognised_status_is_unknown() {
        assert_eq!(WorkloadStatus::parse("Active"), WorkloadStatus::Active);
        assert_eq!(WorkloadStatus::parse("terminated"), WorkloadStatus::Unknown);
    }

    #[test]
    fn summary_counts_apps_and_units() {
        let apps = vec![
            ApplicationStatus::new("keystone", "cs:keystone-1")
                .with_unit(UnitStatus::new("keystone/0", WorkloadStatus::Active))
                .with_unit(UnitStatus::new("keystone/1", WorkloadStatus::Maintenance)),
            ApplicationStatus::new("glance", "cs:glance-1")
                .with_unit(UnitStatus::new("glance/0", WorkloadStatus::Active)),
        ];

        let summary = StatusSummary::of(&apps);
        assert_eq!(summary.applications[&WorkloadStatus::Active], 2);
        assert_eq!(summary.units[&WorkloadStatus::Active], 2);
        assert_eq!(summary.units[&WorkloadStatus::Maintenance], 1);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&WorkloadStatus::Maintenance).unwrap();
        assert_eq!(json, "\"maintenance\"");
    }
}
