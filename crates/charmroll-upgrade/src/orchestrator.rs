//! Upgrade orchestrator.
//!
//! Runs the phases of an upgrade plan in order:
//!
//! 1. charm revision upgrades (unless upgrade-only)
//! 2. the compute ↔ storage access relation patch for the Ocata origin
//! 3. per-application rolling or bulk upgrade, converging after each
//!    (unless charms-only)
//! 4. final status histogram and report
//!
//! Applications are handled strictly one after another. Releasing the
//! controller connection is the caller's job.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use charmroll_client::ClusterClient;
use charmroll_converge::{WaitScope, wait_until};
use charmroll_core::{FleetSnapshot, StatusSummary, UpgradePlan, WorkloadStatus};

use crate::error::UpgradeResult;
use crate::revision::{RevisionOutcome, upgrade_revisions};
use crate::rollable::{Capabilities, is_rollable};
use crate::strategy::{COMPUTE_APPLICATION, StrategyExecutor, StrategyUsed};
use crate::timings::Timings;

/// Origin whose upgrade needs the storage access relation.
pub const RELATION_PATCH_ORIGIN: &str = "cloud:xenial-ocata";

/// Storage backends offering `ceph-access`, preferred first.
pub const STORAGE_BACKENDS: &[&str] = &["cinder-warmceph", "cinder-ceph"];

pub const STORAGE_ACCESS_ENDPOINT: &str = "ceph-access";

/// Per-application upgrade record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppUpgrade {
    pub application: String,
    pub strategy: StrategyUsed,
    pub version_before: Option<String>,
    pub version_after: Option<String>,
}

/// What an upgrade run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    pub revisions: RevisionOutcome,
    /// Storage backend the compute application was related to.
    pub relation_patched: Option<String>,
    pub applications: Vec<AppUpgrade>,
    /// Application statuses at the end of the run.
    pub status: BTreeMap<WorkloadStatus, usize>,
}

/// Drives one upgrade plan against a cluster.
pub struct Orchestrator<'a, C: ?Sized> {
    client: &'a C,
    plan: UpgradePlan,
    timings: Timings,
}

impl<'a, C> Orchestrator<'a, C>
where
    C: ClusterClient + ?Sized,
{
    pub fn new(client: &'a C, plan: UpgradePlan) -> Self {
        Self {
            client,
            plan,
            timings: Timings::default(),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn plan(&self) -> &UpgradePlan {
        &self.plan
    }

    /// Run every phase of the plan.
    pub async fn run(&self) -> UpgradeResult<UpgradeReport> {
        let options = &self.plan.options;
        let snapshot = self.client.status().await?;
        info!(
            applications = %snapshot.application_names().join(", "),
            "applications present in the current model"
        );
        info!(services = %self.plan.applications().join(", "), "services to upgrade");
        if !self.plan.extra_charms.is_empty() && !options.upgrade_only {
            let extra: Vec<String> = self.plan.extra_charms.iter().map(|c| c.name.clone()).collect();
            info!(charms = %extra.join(", "), "charms only upgrade");
        }

        let mut report = UpgradeReport::default();

        if !options.upgrade_only {
            report.revisions = upgrade_revisions(self.client, &self.plan, &self.timings).await?;
        }

        if let Some(backend) = self.relation_patch_backend() {
            self.patch_storage_relation(backend).await?;
            report.relation_patched = Some(backend.to_string());
        }

        if !options.charms_only {
            report.applications = self.upgrade_applications().await?;
        }

        let snapshot = self.client.status().await?;
        report.status = StatusSummary::of(&snapshot.applications).applications;
        info!(status = ?report.status, "final application status");

        Ok(report)
    }

    /// Storage backend to relate to the compute application, if the
    /// plan needs the patch.
    pub fn relation_patch_backend(&self) -> Option<&'static str> {
        let options = &self.plan.options;
        let apps = self.plan.applications();
        if options.charms_only
            || options.origin != RELATION_PATCH_ORIGIN
            || !apps.iter().any(|a| a == COMPUTE_APPLICATION)
        {
            return None;
        }
        STORAGE_BACKENDS
            .iter()
            .copied()
            .find(|backend| apps.iter().any(|a| a == backend))
    }

    async fn patch_storage_relation(&self, backend: &str) -> UpgradeResult<()> {
        let compute = format!("{COMPUTE_APPLICATION}:{STORAGE_ACCESS_ENDPOINT}");
        let storage = format!("{backend}:{STORAGE_ACCESS_ENDPOINT}");
        info!(%compute, %storage, "adding relation");
        if self.plan.options.dry_run {
            return Ok(());
        }

        match self.client.add_relation(&compute, &storage).await {
            Ok(()) => {
                tokio::time::sleep(self.timings.relation_settle).await;
                wait_until(self.client, &WaitScope::Fleet, &self.timings.settle_wait()).await?;
                info!("completed addition of relation");
                Ok(())
            }
            Err(e) if e.is_benign_conflict() => {
                warn!(error = %e, "ignored: relation already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upgrade_applications(&self) -> UpgradeResult<Vec<AppUpgrade>> {
        let options = &self.plan.options;
        let names = self.plan.applications();
        let executor = StrategyExecutor::new(self.client, &self.plan, &self.timings);

        let before = self.client.status().await?;
        let order: Vec<String> = names
            .iter()
            .filter(|n| before.contains(n))
            .map(|n| format!("{n} ({})", version_of(&before, n).unwrap_or_default()))
            .collect();
        info!(order = %order.join(", "), "application upgrade order");

        let mut upgrades = Vec::new();
        for name in &names {
            let snapshot = self.client.status().await?;
            let Some(app) = snapshot.application(name) else {
                continue;
            };

            let capabilities = Capabilities::fetch(self.client, name).await;
            let rollable = is_rollable(
                self.client,
                app,
                &capabilities,
                &options.upgrade_action,
                options.dry_run,
            )
            .await;

            // A custom action always goes through the per-unit path.
            let strategy = if options.upgrade_action.is_custom() || rollable {
                executor.rolling(app, &snapshot, &capabilities).await?
            } else {
                executor.bulk(name).await?
            };

            wait_until(self.client, &WaitScope::Fleet, &self.timings.fleet_wait()).await?;

            upgrades.push(AppUpgrade {
                application: name.clone(),
                strategy,
                version_before: version_of(&before, name),
                version_after: None,
            });
        }

        let after = self.client.status().await?;
        for upgrade in &mut upgrades {
            upgrade.version_after = version_of(&after, &upgrade.application);
        }
        let summary: Vec<String> = upgrades
            .iter()
            .map(|u| {
                format!(
                    "{} ({}=>{})",
                    u.application,
                    u.version_before.as_deref().unwrap_or_default(),
                    u.version_after.as_deref().unwrap_or_default()
                )
            })
            .collect();
        info!(order = %summary.join(", "), "application upgrade order");
        info!(count = upgrades.len(), "upgrade finished");

        Ok(upgrades)
    }
}

fn version_of(snapshot: &FleetSnapshot, application: &str) -> Option<String> {
    snapshot
        .application(application)
        .and_then(|a| a.workload_version.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use charmroll_client::{Call, Fault, MemoryCluster};
    use charmroll_core::{ApplicationStatus, UnitStatus, UpgradeOptions, UpgradeSettings};

    fn plan(apps: &[&str], options: UpgradeOptions) -> UpgradePlan {
        UpgradePlan::build(
            UpgradeSettings::default(),
            UpgradeOptions {
                apps: apps.iter().map(|a| a.to_string()).collect(),
                ..options
            },
        )
    }

    fn single(name: &str) -> ApplicationStatus {
        ApplicationStatus::new(name, &format!("cs:xenial/{name}-1"))
            .with_unit(UnitStatus::new(&format!("{name}/0"), WorkloadStatus::Active))
    }

    fn relation_calls(cluster: &MemoryCluster) -> Vec<(String, String)> {
        cluster
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddRelation { a, b } => Some((a, b)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn patch_prefers_warmceph() {
        let cluster = MemoryCluster::new();
        let orchestrator = Orchestrator::new(
            &cluster,
            plan(&["nova-compute", "cinder-ceph", "cinder-warmceph"], UpgradeOptions::default()),
        );
        assert_eq!(orchestrator.relation_patch_backend(), Some("cinder-warmceph"));
    }

    #[test]
    fn patch_needs_ocata_and_compute() {
        let cluster = MemoryCluster::new();
        let newton = Orchestrator::new(
            &cluster,
            plan(
                &["nova-compute", "cinder-ceph"],
                UpgradeOptions {
                    origin: "cloud:xenial-newton".into(),
                    ..Default::default()
                },
            ),
        );
        assert_eq!(newton.relation_patch_backend(), None);

        let no_compute = Orchestrator::new(&cluster, plan(&["cinder-ceph"], UpgradeOptions::default()));
        assert_eq!(no_compute.relation_patch_backend(), None);

        let charms_only = Orchestrator::new(
            &cluster,
            plan(
                &["nova-compute", "cinder-ceph"],
                UpgradeOptions {
                    charms_only: true,
                    ..Default::default()
                },
            ),
        );
        assert_eq!(charms_only.relation_patch_backend(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_relation_is_tolerated() {
        let cluster = MemoryCluster::new()
            .with_application(single("nova-compute"))
            .with_application(single("cinder-ceph"))
            .with_relation_fault(Fault::Rejected("relation already exists".into()));
        let orchestrator = Orchestrator::new(
            &cluster,
            plan(
                &["nova-compute", "cinder-ceph"],
                UpgradeOptions {
                    upgrade_only: true,
                    ..Default::default()
                },
            ),
        );

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.relation_patched.as_deref(), Some("cinder-ceph"));
        assert_eq!(
            relation_calls(&cluster),
            vec![("nova-compute:ceph-access".to_string(), "cinder-ceph:ceph-access".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn other_relation_errors_abort() {
        let cluster = MemoryCluster::new()
            .with_application(single("nova-compute"))
            .with_application(single("cinder-ceph"))
            .with_relation_fault(Fault::Rejected("endpoint ceph-access not found".into()));
        let orchestrator = Orchestrator::new(
            &cluster,
            plan(
                &["nova-compute", "cinder-ceph"],
                UpgradeOptions {
                    upgrade_only: true,
                    ..Default::default()
                },
            ),
        );

        assert!(orchestrator.run().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn charms_only_skips_strategies() {
        let cluster = MemoryCluster::new()
            .with_application(single("glance"))
            .with_latest_revision("glance", 2);
        let orchestrator = Orchestrator::new(
            &cluster,
            plan(
                &["glance"],
                UpgradeOptions {
                    charms_only: true,
                    ..Default::default()
                },
            ),
        );

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.revisions.upgraded, vec!["glance".to_string()]);
        assert!(report.applications.is_empty());
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::GetActions { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn single_unit_app_goes_bulk() {
        let cluster = MemoryCluster::new()
            .with_application(single("glance"))
            .with_actions("glance", &["openstack-upgrade"])
            .with_config("glance", "openstack-origin", Some("cloud:xenial-newton"));
        let orchestrator = Orchestrator::new(
            &cluster,
            plan(
                &["glance"],
                UpgradeOptions {
                    upgrade_only: true,
                    ..Default::default()
                },
            ),
        );

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.applications[0].strategy, StrategyUsed::Bulk);
        assert_eq!(
            cluster.config_value("glance", "openstack-origin").as_deref(),
            Some("cloud:xenial-ocata")
        );
        assert_eq!(report.status[&WorkloadStatus::Active], 1);
    }
}
