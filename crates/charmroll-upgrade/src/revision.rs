//! Charm revision upgrades.
//!
//! For every charm in the plan, compare the deployed revision with a
//! target: the pinned revision when the plan names one, otherwise the
//! latest revision in the catalog. Charms behind their target are
//! upgraded one at a time. A catalog that cannot be reached does not
//! stop the run; the upgrade is attempted without a revision instead.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{error, info, warn};

use charmroll_client::ClusterClient;
use charmroll_converge::{WaitScope, wait_until};
use charmroll_core::{CharmRef, UpgradePlan, WorkloadStatus};

use crate::error::{UpgradeError, UpgradeResult};
use crate::timings::Timings;

/// Units whose workload message contains this are considered healthy.
const READY_MARKER: &str = "ready";

/// Revision an application should be upgraded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionTarget {
    /// Pinned in the plan. The catalog is not consulted.
    Pinned(u32),
    /// Latest revision published in the catalog.
    Latest(u32),
    /// The catalog lookup failed; upgrade to whatever is latest.
    Unknown,
    /// Locally built charm, never upgraded.
    Local,
}

impl RevisionTarget {
    pub fn revision(&self) -> Option<u32> {
        match self {
            RevisionTarget::Pinned(r) | RevisionTarget::Latest(r) => Some(*r),
            RevisionTarget::Unknown | RevisionTarget::Local => None,
        }
    }

    /// Whether a deployed charm at `current` needs upgrading.
    pub fn needs_upgrade(&self, current: u32) -> bool {
        match self {
            RevisionTarget::Pinned(target) | RevisionTarget::Latest(target) => current < *target,
            RevisionTarget::Unknown => true,
            RevisionTarget::Local => false,
        }
    }
}

/// Result of the revision phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevisionOutcome {
    /// Applications whose charm was upgraded (or would be, in a dry run).
    pub upgraded: Vec<String>,
    /// Applications already at their target revision.
    pub latest: Vec<String>,
    /// Applications running a local charm.
    pub local: Vec<String>,
    /// Applications whose upgrade failed and was skipped.
    pub failed: Vec<String>,
    /// Unit workload statuses after the phase.
    pub unit_statuses: BTreeMap<WorkloadStatus, usize>,
    /// Workload messages of units that are not ready.
    pub messages: BTreeMap<String, usize>,
}

/// Determine the target revision for a deployed charm.
pub async fn resolve_target<C>(client: &C, deployed: &CharmRef, requested: &CharmRef) -> RevisionTarget
where
    C: ClusterClient + ?Sized,
{
    if !deployed.is_catalogued() {
        return RevisionTarget::Local;
    }
    if let Some(pin) = requested.revision {
        return RevisionTarget::Pinned(pin);
    }
    match client.latest_revision(&deployed.name).await {
        Ok(latest) => RevisionTarget::Latest(latest),
        Err(e) => {
            warn!(charm = %deployed, error = %e, "failed loading information from catalog");
            RevisionTarget::Unknown
        }
    }
}

/// Upgrade every charm in the plan that is behind its target.
pub async fn upgrade_revisions<C>(
    client: &C,
    plan: &UpgradePlan,
    timings: &Timings,
) -> UpgradeResult<RevisionOutcome>
where
    C: ClusterClient + ?Sized,
{
    let options = &plan.options;
    let targets = plan.charm_targets();
    let snapshot = client.status().await?;
    let mut outcome = RevisionOutcome::default();
    let mut hard_failure = false;

    info!(charms = targets.len(), "upgrading charms");

    for requested in &targets {
        let name = &requested.name;
        let Some(app) = snapshot.application(name) else {
            warn!(app = %name, "unable to find application");
            continue;
        };

        let deployed = CharmRef::parse(&app.charm_url);
        let current = deployed.revision.unwrap_or(0);
        let target = resolve_target(client, &deployed, requested).await;

        if target == RevisionTarget::Local {
            info!(app = %name, charm = %app.charm_url, "not upgrading local charm");
            outcome.local.push(name.clone());
            continue;
        }
        if !target.needs_upgrade(current) {
            outcome.latest.push(name.clone());
            continue;
        }

        let to = target
            .revision()
            .map_or_else(|| "latest".to_string(), |r| r.to_string());
        info!(app = %name, from = current, %to, "upgrading charm");

        if options.dry_run {
            outcome.upgraded.push(name.clone());
            continue;
        }

        match client.upgrade_charm(name, target.revision()).await {
            Ok(()) => {
                tokio::time::sleep(timings.charm_settle).await;
                outcome.upgraded.push(name.clone());
            }
            Err(e) if e.is_rejection() => {
                warn!(app = %name, error = %e, "not upgrading");
            }
            Err(e) => {
                error!(app = %name, error = %e, "failed upgrading");
                outcome.failed.push(name.clone());
                if !options.ignore_errors {
                    hard_failure = true;
                    break;
                }
            }
        }
    }

    info!(count = outcome.upgraded.len(), "upgraded charms");

    if !options.dry_run && !outcome.upgraded.is_empty() {
        tokio::time::sleep(timings.post_revision_settle).await;
        wait_until(client, &WaitScope::Fleet, &timings.settle_wait()).await?;
    }

    info!("collecting final workload status");
    tokio::time::sleep(timings.collect_delay).await;
    let snapshot = client.status().await?;
    for app in snapshot
        .applications
        .iter()
        .filter(|a| targets.iter().any(|t| t.name == a.name))
    {
        for unit in &app.units {
            *outcome.unit_statuses.entry(unit.workload_status).or_default() += 1;
            if !unit.workload_message.contains(READY_MARKER) {
                *outcome.messages.entry(unit.workload_message.clone()).or_default() += 1;
            }
        }
    }
    info!(units = ?outcome.unit_statuses, "status of units after revision upgrade");
    info!(messages = ?outcome.messages, "workload messages");

    if !options.ignore_errors {
        if hard_failure {
            return Err(UpgradeError::RevisionPhase(format!(
                "failed upgrading {}",
                outcome.failed.join(", ")
            )));
        }
        if outcome.unit_statuses.contains_key(&WorkloadStatus::Error) {
            return Err(UpgradeError::RevisionPhase(
                "units in error after charm upgrades".to_string(),
            ));
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use charmroll_client::{Call, Fault, MemoryCluster};
    use charmroll_core::{ApplicationStatus, UnitStatus, UpgradeOptions, UpgradeSettings};

    fn app(name: &str, url: &str) -> ApplicationStatus {
        ApplicationStatus::new(name, url)
            .with_unit(UnitStatus::new(&format!("{name}/0"), WorkloadStatus::Active).with_message("Unit is ready"))
    }

    fn plan(apps: &[&str], options: UpgradeOptions) -> UpgradePlan {
        UpgradePlan::build(
            UpgradeSettings::default(),
            UpgradeOptions {
                apps: apps.iter().map(|a| a.to_string()).collect(),
                ..options
            },
        )
    }

    fn catalog_queries(cluster: &MemoryCluster) -> Vec<String> {
        cluster
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::LatestRevision { charm } => Some(charm),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn upgrade_decision() {
        assert!(RevisionTarget::Pinned(12).needs_upgrade(3));
        assert!(!RevisionTarget::Latest(3).needs_upgrade(3));
        assert!(!RevisionTarget::Latest(2).needs_upgrade(3));
        assert!(RevisionTarget::Unknown.needs_upgrade(300));
        assert!(!RevisionTarget::Local.needs_upgrade(0));
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_revision_skips_catalog() {
        let cluster = MemoryCluster::new()
            .with_application(app("glance", "cs:xenial/glance-3"))
            .with_latest_revision("glance", 40);

        let outcome = upgrade_revisions(
            &cluster,
            &plan(&["cs:glance-12"], UpgradeOptions::default()),
            &Timings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.upgraded, vec!["glance".to_string()]);
        assert!(catalog_queries(&cluster).is_empty());
        assert!(cluster.calls().contains(&Call::UpgradeCharm {
            application: "glance".into(),
            revision: Some(12),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_catalog_forces_attempt() {
        let cluster = MemoryCluster::new().with_application(app("keystone", "cs:xenial/keystone-281"));

        let outcome = upgrade_revisions(
            &cluster,
            &plan(&["keystone"], UpgradeOptions::default()),
            &Timings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.upgraded, vec!["keystone".to_string()]);
        assert_eq!(catalog_queries(&cluster), vec!["keystone".to_string()]);
        assert!(cluster.calls().contains(&Call::UpgradeCharm {
            application: "keystone".into(),
            revision: None,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn current_charms_are_left_alone() {
        let cluster = MemoryCluster::new()
            .with_application(app("keystone", "cs:xenial/keystone-281"))
            .with_application(app("glance", "local:xenial/glance-0"))
            .with_latest_revision("keystone", 281);

        let outcome = upgrade_revisions(
            &cluster,
            &plan(&["keystone", "glance", "cinder"], UpgradeOptions::default()),
            &Timings::default(),
        )
        .await
        .unwrap();

        assert!(outcome.upgraded.is_empty());
        assert_eq!(outcome.latest, vec!["keystone".to_string()]);
        assert_eq!(outcome.local, vec!["glance".to_string()]);
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::UpgradeCharm { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_skipped_without_failing() {
        let cluster = MemoryCluster::new()
            .with_application(app("glance", "cs:xenial/glance-3"))
            .with_application(app("cinder", "cs:xenial/cinder-3"))
            .with_latest_revision("glance", 4)
            .with_latest_revision("cinder", 4)
            .with_upgrade_fault("glance", Fault::Rejected("already running latest charm".into()));

        let outcome = upgrade_revisions(
            &cluster,
            &plan(&["glance", "cinder"], UpgradeOptions::default()),
            &Timings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.upgraded, vec!["cinder".to_string()]);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failure_aborts_phase() {
        let cluster = MemoryCluster::new()
            .with_application(app("glance", "cs:xenial/glance-3"))
            .with_application(app("cinder", "cs:xenial/cinder-3"))
            .with_latest_revision("glance", 4)
            .with_latest_revision("cinder", 4)
            .with_upgrade_fault("glance", Fault::Command("charm download failed".into()));

        let err = upgrade_revisions(
            &cluster,
            &plan(&["glance", "cinder"], UpgradeOptions::default()),
            &Timings::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, UpgradeError::RevisionPhase(_)));
        // Nothing after the failure was attempted.
        assert!(!cluster.calls().contains(&Call::UpgradeCharm {
            application: "cinder".into(),
            revision: Some(4),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn ignore_errors_continues_past_failure() {
        let cluster = MemoryCluster::new()
            .with_application(app("glance", "cs:xenial/glance-3"))
            .with_application(app("cinder", "cs:xenial/cinder-3"))
            .with_latest_revision("glance", 4)
            .with_latest_revision("cinder", 4)
            .with_upgrade_fault("glance", Fault::Command("charm download failed".into()));

        let outcome = upgrade_revisions(
            &cluster,
            &plan(
                &["glance", "cinder"],
                UpgradeOptions {
                    ignore_errors: true,
                    ..Default::default()
                },
            ),
            &Timings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.upgraded, vec!["cinder".to_string()]);
        assert_eq!(outcome.failed, vec!["glance".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn units_in_error_fail_the_phase() {
        let cluster = MemoryCluster::new().with_application(
            ApplicationStatus::new("glance", "cs:xenial/glance-4")
                .with_unit(UnitStatus::new("glance/0", WorkloadStatus::Error).with_message("hook failed")),
        )
        .with_latest_revision("glance", 4);

        let err = upgrade_revisions(
            &cluster,
            &plan(&["glance"], UpgradeOptions::default()),
            &Timings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpgradeError::RevisionPhase(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_upgrades_nothing() {
        let cluster = MemoryCluster::new()
            .with_application(app("glance", "cs:xenial/glance-3"))
            .with_latest_revision("glance", 4);

        let outcome = upgrade_revisions(
            &cluster,
            &plan(
                &["glance"],
                UpgradeOptions {
                    dry_run: true,
                    ..Default::default()
                },
            ),
            &Timings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.upgraded, vec!["glance".to_string()]);
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::UpgradeCharm { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn collects_not_ready_messages() {
        let cluster = MemoryCluster::new()
            .with_application(
                ApplicationStatus::new("keystone", "cs:xenial/keystone-5")
                    .with_unit(UnitStatus::new("keystone/0", WorkloadStatus::Active).with_message("Unit is ready"))
                    .with_unit(UnitStatus::new("keystone/1", WorkloadStatus::Blocked).with_message("Missing relation")),
            )
            .with_latest_revision("keystone", 5);

        let outcome = upgrade_revisions(
            &cluster,
            &plan(&["keystone"], UpgradeOptions::default()),
            &Timings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.unit_statuses[&WorkloadStatus::Active], 1);
        assert_eq!(outcome.unit_statuses[&WorkloadStatus::Blocked], 1);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages["Missing relation"], 1);
    }
}
