//! Upgrade settings file parser.
//!
//! The settings file overrides the built-in service order and origin
//! keys. YAML and TOML are both accepted, picked by file extension.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Config key most OpenStack charms read their origin from.
pub const DEFAULT_ORIGIN_KEY: &str = "openstack-origin";

/// Charms that read the origin from a different key.
pub const ORIGIN_KEY_OVERRIDES: &[(&str, &str)] = &[
    ("ceph", "source"),
    ("ceph-osd", "source"),
    ("ceph-mon", "source"),
    ("ceph-radosgw", "source"),
];

/// Default upgrade order when neither `--apps` nor the settings file
/// names one.
pub const DEFAULT_SERVICES: &[&str] = &[
    // identity
    "keystone",
    // storage
    "ceph-mon",
    "ceph-osd",
    "ceph-radosgw",
    // image
    "glance",
    // compute
    "nova-cloud-controller",
    "nova-compute",
    // network
    "neutron-api",
    "neutron-gateway",
    "neutron-openvswitch",
    // block storage
    "cinder",
    "cinder-ceph",
    "openstack-dashboard",
    "rabbitmq-server",
];

/// Built-in origin key overrides as an owned map.
pub fn default_origin_keys() -> BTreeMap<String, String> {
    ORIGIN_KEY_OVERRIDES
        .iter()
        .map(|(app, key)| (app.to_string(), key.to_string()))
        .collect()
}

pub fn default_services() -> Vec<String> {
    DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect()
}

/// Contents of a settings file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeSettings {
    /// Application name → config key holding the origin.
    pub origin_keys: Option<BTreeMap<String, String>>,
    /// Ordered list of charm references to upgrade.
    pub services: Option<Vec<String>>,
    /// Extra charms whose revision is upgraded but which get no
    /// origin change.
    pub add_services: Option<Vec<String>>,
}

impl UpgradeSettings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
        let settings = if is_toml {
            toml::from_str(&content)?
        } else if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(&content)?
        };
        Ok(settings)
    }

    /// Load the settings file, falling back to empty settings on any
    /// failure. A broken settings file never aborts an upgrade.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::from_file(path) {
            Ok(settings) => {
                debug!(path = %path.display(), "loaded settings file");
                settings
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load settings file");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parse_yaml_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        fs::write(
            &path,
            "origin_keys:\n  ceph-mon: source\nservices:\n  - keystone\n  - cs:xenial/glance-12\nadd_services:\n  - ntp\n",
        )
        .unwrap();

        let settings = UpgradeSettings::from_file(&path).unwrap();
        assert_eq!(settings.origin_keys.unwrap()["ceph-mon"], "source");
        assert_eq!(
            settings.services.unwrap(),
            vec!["keystone".to_string(), "cs:xenial/glance-12".to_string()]
        );
        assert_eq!(settings.add_services.unwrap(), vec!["ntp".to_string()]);
    }

    #[test]
    fn parse_toml_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "services = [\"keystone\"]\n\n[origin_keys]\nglance = \"source\"\n").unwrap();

        let settings = UpgradeSettings::from_file(&path).unwrap();
        assert_eq!(settings.services.unwrap(), vec!["keystone".to_string()]);
        assert_eq!(settings.origin_keys.unwrap()["glance"], "source");
        assert!(settings.add_services.is_none());
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        fs::write(&path, "services: [unterminated\n").unwrap();

        let settings = UpgradeSettings::load_or_default(Some(&path));
        assert_eq!(settings, UpgradeSettings::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = UpgradeSettings::load_or_default(Some(Path::new("/nonexistent/settings.yaml")));
        assert_eq!(settings, UpgradeSettings::default());
        assert_eq!(UpgradeSettings::load_or_default(None), UpgradeSettings::default());
    }

    #[test]
    fn default_origin_keys_cover_ceph() {
        let keys = default_origin_keys();
        assert_eq!(keys["ceph-osd"], "source");
        assert!(!keys.contains_key("keystone"));
    }
}
