//! Upgrade plan: what to upgrade, in which order, and how.
//!
//! Built once per invocation from command-line options and the optional
//! settings file. The plan itself is immutable while the upgrade runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::charm::CharmRef;
use crate::settings::{DEFAULT_ORIGIN_KEY, UpgradeSettings, default_origin_keys, default_services};

/// Action conventionally exposed by OpenStack charms for rolling upgrades.
pub const DEFAULT_UPGRADE_ACTION: &str = "openstack-upgrade";

/// Origin used when none is given.
pub const DEFAULT_ORIGIN: &str = "cloud:xenial-ocata";

/// Which remote action performs a per-unit upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeAction {
    /// The conventional `openstack-upgrade` action.
    #[default]
    Default,
    /// An action named by the operator.
    Custom(String),
}

impl UpgradeAction {
    /// Empty or absent names, and the conventional name itself, give
    /// [`UpgradeAction::Default`].
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some(n) if !n.is_empty() && n != DEFAULT_UPGRADE_ACTION => {
                UpgradeAction::Custom(n.to_string())
            }
            _ => UpgradeAction::Default,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            UpgradeAction::Default => DEFAULT_UPGRADE_ACTION,
            UpgradeAction::Custom(name) => name,
        }
    }

    /// Decided by name, so `Custom("openstack-upgrade")` is not custom.
    pub fn is_custom(&self) -> bool {
        self.name() != DEFAULT_UPGRADE_ACTION
    }
}

/// Operator-supplied upgrade options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeOptions {
    /// Ordered charm references. Replaces the configured order when set.
    pub apps: Vec<String>,
    /// Target origin, e.g. `cloud:xenial-ocata`. Empty means no origin change.
    pub origin: String,
    /// Application → origin config key, from the command line.
    pub origin_keys: BTreeMap<String, String>,
    pub dry_run: bool,
    pub ignore_errors: bool,
    pub pause: bool,
    pub evacuate: bool,
    /// Only upgrade charm revisions.
    pub charms_only: bool,
    /// Skip charm revision upgrades.
    pub upgrade_only: bool,
    pub upgrade_action: UpgradeAction,
    pub upgrade_params: BTreeMap<String, String>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            apps: Vec::new(),
            origin: DEFAULT_ORIGIN.to_string(),
            origin_keys: BTreeMap::new(),
            dry_run: false,
            ignore_errors: false,
            pause: false,
            evacuate: false,
            charms_only: false,
            upgrade_only: false,
            upgrade_action: UpgradeAction::Default,
            upgrade_params: BTreeMap::new(),
        }
    }
}

/// Resolved upgrade plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePlan {
    /// Applications receiving revision and origin upgrades, in order.
    pub services: Vec<CharmRef>,
    /// Charms whose revision is upgraded but whose origin is left alone.
    pub extra_charms: Vec<CharmRef>,
    /// Application → origin config key.
    pub origin_keys: BTreeMap<String, String>,
    pub options: UpgradeOptions,
}

impl UpgradePlan {
    /// Merge settings and options.
    ///
    /// Origin keys: settings file, then command line, then built-ins.
    /// An explicit application list replaces the configured order and
    /// drops the extra charms list.
    pub fn build(settings: UpgradeSettings, options: UpgradeOptions) -> Self {
        let origin_keys = match settings.origin_keys {
            Some(keys) => keys,
            None if !options.origin_keys.is_empty() => options.origin_keys.clone(),
            None => default_origin_keys(),
        };

        let (services, extra) = if options.apps.is_empty() {
            (
                settings.services.unwrap_or_else(default_services),
                settings.add_services.unwrap_or_default(),
            )
        } else {
            (options.apps.clone(), Vec::new())
        };

        Self {
            services: services.iter().map(|s| CharmRef::parse(s)).collect(),
            extra_charms: extra.iter().map(|s| CharmRef::parse(s)).collect(),
            origin_keys,
            options,
        }
    }

    /// Application names in upgrade order.
    pub fn applications(&self) -> Vec<String> {
        self.services.iter().map(|c| c.name.clone()).collect()
    }

    /// Every charm whose revision should be checked, services first.
    pub fn charm_targets(&self) -> Vec<CharmRef> {
        self.services
            .iter()
            .chain(self.extra_charms.iter())
            .cloned()
            .collect()
    }

    /// Config key holding the origin for `app`.
    pub fn origin_key(&self, app: &str) -> &str {
        self.origin_keys
            .get(app)
            .map(String::as_str)
            .unwrap_or(DEFAULT_ORIGIN_KEY)
    }
}

/// Parse `a=b,c=d` into a map. Used for `--upgrade-params` and
/// `--origin-keys`.
pub fn parse_key_values(input: &str) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in '{pair}'"));
        }
        map.insert(key.to_string(), value.trim().to_string());
    }
    Ok(map)
}
