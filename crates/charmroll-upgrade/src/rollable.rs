//! Capability negotiation and rollability classification.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use charmroll_client::ClusterClient;
use charmroll_core::{ApplicationStatus, UpgradeAction};

/// Config flag that hands upgrade timing to the orchestrator.
pub const ACTION_MANAGED_UPGRADE: &str = "action-managed-upgrade";

const PAUSE_ACTION: &str = "pause";
const RESUME_ACTION: &str = "resume";

/// Actions an application's charm declares, fetched once per application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    actions: BTreeSet<String>,
}

impl Capabilities {
    pub fn from_actions(actions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// Fetch declared actions. A failed lookup yields no capabilities.
    pub async fn fetch<C>(client: &C, application: &str) -> Self
    where
        C: ClusterClient + ?Sized,
    {
        match client.get_actions(application).await {
            Ok(actions) => Self { actions },
            Err(e) => {
                warn!(app = %application, error = %e, "failed to enumerate actions");
                Self::default()
            }
        }
    }

    pub fn supports(&self, action: &str) -> bool {
        self.actions.contains(action)
    }

    pub fn can_pause(&self) -> bool {
        self.supports(PAUSE_ACTION)
    }

    pub fn can_resume(&self) -> bool {
        self.supports(RESUME_ACTION)
    }
}

/// Whether `app` can be upgraded one unit at a time.
///
/// For the conventional upgrade action this switches the application
/// into action-managed upgrade mode; failing to do so makes it not
/// rollable. Dry runs assume the switch would succeed.
pub async fn is_rollable<C>(
    client: &C,
    app: &ApplicationStatus,
    capabilities: &Capabilities,
    action: &UpgradeAction,
    dry_run: bool,
) -> bool
where
    C: ClusterClient + ?Sized,
{
    if !capabilities.supports(action.name()) {
        warn!(app = %app.name, action = %action.name(), "upgrade action not in actions");
        return false;
    }

    if app.units.len() <= 1 {
        return false;
    }

    if app.name.to_ascii_lowercase().contains("ceph") {
        info!(app = %app.name, "ceph is not rollable");
        return false;
    }

    if !action.is_custom() && !dry_run {
        let values = BTreeMap::from([(ACTION_MANAGED_UPGRADE.to_string(), "True".to_string())]);
        if let Err(e) = client.set_config(&app.name, &values).await {
            warn!(app = %app.name, error = %e, "failed to enable action-managed-upgrade mode");
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use charmroll_client::{Fault, MemoryCluster};
    use charmroll_core::{UnitStatus, WorkloadStatus};

    fn app(name: &str, units: usize) -> ApplicationStatus {
        (0..units).fold(ApplicationStatus::new(name, "cs:xenial/charm-1"), |app, i| {
            app.with_unit(UnitStatus::new(&format!("{name}/{i}"), WorkloadStatus::Active))
        })
    }

    fn upgradable() -> Capabilities {
        Capabilities::from_actions(["openstack-upgrade", "pause", "resume"])
    }

    #[tokio::test]
    async fn clustered_app_with_action_is_rollable() {
        let keystone = app("keystone", 3);
        let cluster = MemoryCluster::new().with_application(keystone.clone());

        assert!(is_rollable(&cluster, &keystone, &upgradable(), &UpgradeAction::Default, false).await);
        assert_eq!(
            cluster.config_value("keystone", ACTION_MANAGED_UPGRADE).as_deref(),
            Some("True")
        );
    }

    #[tokio::test]
    async fn ceph_is_never_rollable() {
        for name in ["ceph-mon", "Cinder-CEPH", "ceph-osd"] {
            let ceph = app(name, 3);
            let cluster = MemoryCluster::new().with_application(ceph.clone());
            assert!(!is_rollable(&cluster, &ceph, &upgradable(), &UpgradeAction::Default, false).await);
        }
    }

    #[tokio::test]
    async fn single_unit_is_not_rollable() {
        let glance = app("glance", 1);
        let cluster = MemoryCluster::new().with_application(glance.clone());
        assert!(!is_rollable(&cluster, &glance, &upgradable(), &UpgradeAction::Default, false).await);
    }

    #[tokio::test]
    async fn missing_action_is_not_rollable() {
        let keystone = app("keystone", 3);
        let cluster = MemoryCluster::new().with_application(keystone.clone());
        let caps = Capabilities::from_actions(["pause", "resume"]);
        assert!(!is_rollable(&cluster, &keystone, &caps, &UpgradeAction::Default, false).await);
    }

    #[tokio::test]
    async fn config_failure_is_not_rollable() {
        let keystone = app("keystone", 3);
        let cluster = MemoryCluster::new()
            .with_application(keystone.clone())
            .with_config_fault("keystone", Fault::Rejected("unknown option".into()));
        assert!(!is_rollable(&cluster, &keystone, &upgradable(), &UpgradeAction::Default, false).await);
    }

    #[tokio::test]
    async fn custom_action_skips_config_switch() {
        let keystone = app("keystone", 2);
        let cluster = MemoryCluster::new()
            .with_application(keystone.clone())
            .with_config_fault("keystone", Fault::Rejected("unknown option".into()));
        let caps = Capabilities::from_actions(["refresh-packages"]);
        let action = UpgradeAction::Custom("refresh-packages".into());
        assert!(is_rollable(&cluster, &keystone, &caps, &action, false).await);
    }

    #[tokio::test]
    async fn explicitly_named_default_action_switches_config() {
        let keystone = app("keystone", 3);
        for action in [
            UpgradeAction::from_name(Some("openstack-upgrade")),
            UpgradeAction::Custom("openstack-upgrade".into()),
        ] {
            let cluster = MemoryCluster::new().with_application(keystone.clone());
            assert!(is_rollable(&cluster, &keystone, &upgradable(), &action, false).await);
            assert_eq!(
                cluster.config_value("keystone", ACTION_MANAGED_UPGRADE).as_deref(),
                Some("True")
            );
        }
    }

    #[tokio::test]
    async fn failed_enumeration_yields_no_capabilities() {
        let cluster = MemoryCluster::new();
        let caps = Capabilities::fetch(&cluster, "missing").await;
        assert_eq!(caps, Capabilities::default());
        assert!(!caps.can_pause());
    }
}
