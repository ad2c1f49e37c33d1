//! Unit ordering and HA subordinate pairing.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use tracing::{debug, info};

use charmroll_client::{ClientResult, ClusterClient};
use charmroll_core::{ApplicationStatus, FleetSnapshot, UnitStatus};

use crate::error::{UpgradeError, UpgradeResult};

/// Interface provided by HA cluster subordinates.
pub const HACLUSTER_INTERFACE: &str = "hacluster";

/// Answer to "which unit leads this application".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leadership {
    None,
    One(String),
    Many(Vec<String>),
}

impl Leadership {
    /// Fold per-unit leadership flags, in unit order.
    pub fn from_flags(flags: impl IntoIterator<Item = (String, bool)>) -> Self {
        let mut leaders: Vec<String> = flags
            .into_iter()
            .filter_map(|(unit, leader)| leader.then_some(unit))
            .collect();
        match leaders.len() {
            0 => Leadership::None,
            1 => Leadership::One(leaders.remove(0)),
            _ => Leadership::Many(leaders),
        }
    }
}

/// Ask every unit whether it leads. Queries run concurrently.
pub async fn query_leadership<C>(client: &C, units: &[UnitStatus]) -> ClientResult<Leadership>
where
    C: ClusterClient + ?Sized,
{
    let flags = try_join_all(units.iter().map(|unit| async move {
        let leader = client.is_leader(&unit.name).await?;
        Ok::<_, charmroll_client::ClientError>((unit.name.clone(), leader))
    }))
    .await?;
    Ok(Leadership::from_flags(flags))
}

/// Units of `app` with the leader first, the rest in their original order.
pub async fn order_units<C>(client: &C, app: &ApplicationStatus) -> UpgradeResult<Vec<UnitStatus>>
where
    C: ClusterClient + ?Sized,
{
    info!(app = %app.name, "determining order of units");

    let leader = match query_leadership(client, &app.units).await? {
        Leadership::One(unit) => unit,
        Leadership::None => {
            return Err(UpgradeError::NoLeader {
                application: app.name.clone(),
            });
        }
        Leadership::Many(units) => {
            return Err(UpgradeError::MultipleLeaders {
                application: app.name.clone(),
                units,
            });
        }
    };

    let (first, rest): (Vec<UnitStatus>, Vec<UnitStatus>) =
        app.units.iter().cloned().partition(|u| u.name == leader);
    let ordered: Vec<UnitStatus> = first.into_iter().chain(rest).collect();

    let names: Vec<&str> = ordered.iter().map(|u| u.name.as_str()).collect();
    info!(app = %app.name, %leader, order = %names.join(", "), "upgrade order");
    Ok(ordered)
}

/// Map each unit of `app` to the HA subordinate unit on the same address.
///
/// Uses the first subordinate relation providing the `hacluster`
/// interface. Empty when there is none. Two subordinate units sharing an
/// address is an error.
pub fn hacluster_pairs(
    app: &ApplicationStatus,
    snapshot: &FleetSnapshot,
) -> UpgradeResult<BTreeMap<String, UnitStatus>> {
    let Some(relation) = app
        .relations
        .iter()
        .find(|r| r.subordinate && r.interface == HACLUSTER_INTERFACE)
    else {
        return Ok(BTreeMap::new());
    };
    let Some(subordinate) = snapshot.application(&relation.remote_application) else {
        debug!(app = %app.name, remote = %relation.remote_application, "hacluster application not in status");
        return Ok(BTreeMap::new());
    };

    let mut by_address: BTreeMap<&str, &UnitStatus> = BTreeMap::new();
    for sub_unit in &subordinate.units {
        let Some(address) = sub_unit.public_address.as_deref() else {
            continue;
        };
        if let Some(existing) = by_address.insert(address, sub_unit) {
            return Err(UpgradeError::PairingConflict {
                application: subordinate.name.clone(),
                address: address.to_string(),
                first: existing.name.clone(),
                second: sub_unit.name.clone(),
            });
        }
    }

    let pairs: BTreeMap<String, UnitStatus> = app
        .units
        .iter()
        .filter_map(|unit| {
            let address = unit.public_address.as_deref()?;
            by_address
                .get(address)
                .map(|sub| (unit.name.clone(), (*sub).clone()))
        })
        .collect();
    debug!(app = %app.name, pairs = pairs.len(), "hacluster subordinate pairs");
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use charmroll_client::MemoryCluster;
    use charmroll_core::{RelationInfo, WorkloadStatus};

    fn keystone() -> ApplicationStatus {
        ApplicationStatus::new("keystone", "cs:xenial/keystone-1")
            .with_unit(UnitStatus::new("keystone/0", WorkloadStatus::Active).with_address("10.0.0.1"))
            .with_unit(UnitStatus::new("keystone/1", WorkloadStatus::Active).with_address("10.0.0.2"))
            .with_unit(UnitStatus::new("keystone/2", WorkloadStatus::Active).with_address("10.0.0.3"))
            .with_relation(RelationInfo {
                endpoint: "ha".into(),
                interface: HACLUSTER_INTERFACE.into(),
                remote_application: "keystone-hacluster".into(),
                subordinate: true,
            })
    }

    fn hacluster(addresses: &[&str]) -> ApplicationStatus {
        addresses
            .iter()
            .enumerate()
            .fold(ApplicationStatus::new("keystone-hacluster", "cs:xenial/hacluster-1"), |app, (i, addr)| {
                app.with_unit(
                    UnitStatus::new(&format!("keystone-hacluster/{i}"), WorkloadStatus::Active).with_address(addr),
                )
            })
    }

    #[tokio::test]
    async fn leader_goes_first_rest_keep_order() {
        let cluster = MemoryCluster::new()
            .with_application(keystone())
            .with_leader("keystone/1");

        let ordered = order_units(&cluster, &keystone()).await.unwrap();
        let names: Vec<_> = ordered.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["keystone/1", "keystone/0", "keystone/2"]);
    }

    #[tokio::test]
    async fn no_leader_is_an_error() {
        let cluster = MemoryCluster::new().with_application(keystone());
        let err = order_units(&cluster, &keystone()).await.unwrap_err();
        assert!(matches!(err, UpgradeError::NoLeader { .. }));
    }

    #[tokio::test]
    async fn several_leaders_is_an_error() {
        let cluster = MemoryCluster::new()
            .with_application(keystone())
            .with_leader("keystone/0")
            .with_leader("keystone/2");
        let err = order_units(&cluster, &keystone()).await.unwrap_err();
        match err {
            UpgradeError::MultipleLeaders { units, .. } => {
                assert_eq!(units, vec!["keystone/0".to_string(), "keystone/2".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn leadership_fold() {
        assert_eq!(Leadership::from_flags(vec![]), Leadership::None);
        assert_eq!(
            Leadership::from_flags(vec![("a/0".into(), false), ("a/1".into(), true)]),
            Leadership::One("a/1".into())
        );
    }

    #[test]
    fn pairs_units_by_address() {
        let snapshot = FleetSnapshot {
            applications: vec![keystone(), hacluster(&["10.0.0.3", "10.0.0.1", "10.0.0.2"])],
            machines: Vec::new(),
        };
        let pairs = hacluster_pairs(&keystone(), &snapshot).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs["keystone/0"].name, "keystone-hacluster/1");
        assert_eq!(pairs["keystone/2"].name, "keystone-hacluster/0");
    }

    #[test]
    fn duplicate_subordinate_address_is_an_error() {
        let snapshot = FleetSnapshot {
            applications: vec![keystone(), hacluster(&["10.0.0.1", "10.0.0.1"])],
            machines: Vec::new(),
        };
        let err = hacluster_pairs(&keystone(), &snapshot).unwrap_err();
        assert!(matches!(err, UpgradeError::PairingConflict { .. }));
    }

    #[test]
    fn no_hacluster_relation_means_no_pairs() {
        let plain = ApplicationStatus::new("glance", "cs:glance-1")
            .with_unit(UnitStatus::new("glance/0", WorkloadStatus::Active).with_address("10.0.0.9"));
        let snapshot = FleetSnapshot {
            applications: vec![plain.clone()],
            machines: Vec::new(),
        };
        assert!(hacluster_pairs(&plain, &snapshot).unwrap().is_empty());
    }
}
