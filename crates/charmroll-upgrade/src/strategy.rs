//! Rolling and bulk upgrade strategies.
//!
//! A rolling upgrade changes the application's origin, then runs the
//! upgrade action on one unit at a time, leader first, optionally
//! wrapped in pause/resume of the unit and its HA subordinate, and
//! waits for the fleet to converge after every unit.
//!
//! A bulk upgrade only changes the origin and lets every unit upgrade
//! itself. There is no action handle to wait on, so completion is
//! inferred from unit workload messages.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use charmroll_client::ClusterClient;
use charmroll_converge::{WaitScope, wait_until};
use charmroll_core::{ApplicationStatus, FleetSnapshot, UpgradePlan, UnitStatus};

use crate::error::{UpgradeError, UpgradeResult};
use crate::rollable::Capabilities;
use crate::sequencer::{hacluster_pairs, order_units};
use crate::timings::Timings;

/// Compute application whose units would need evacuating first.
pub const COMPUTE_APPLICATION: &str = "nova-compute";

/// Workload messages containing this (any case) mean an upgrade is running.
const UPGRADE_IN_PROGRESS: &str = "upgrad";

/// How an application was upgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyUsed {
    Rolling,
    Bulk,
    /// The origin key does not exist on the application.
    Skipped,
}

/// Runs upgrade strategies for the applications of one plan.
pub struct StrategyExecutor<'a, C: ?Sized> {
    client: &'a C,
    plan: &'a UpgradePlan,
    timings: &'a Timings,
}

impl<'a, C> StrategyExecutor<'a, C>
where
    C: ClusterClient + ?Sized,
{
    pub fn new(client: &'a C, plan: &'a UpgradePlan, timings: &'a Timings) -> Self {
        Self {
            client,
            plan,
            timings,
        }
    }

    fn dry_run(&self) -> bool {
        self.plan.options.dry_run
    }

    /// Upgrade `app` one unit at a time.
    pub async fn rolling(
        &self,
        app: &ApplicationStatus,
        snapshot: &FleetSnapshot,
        capabilities: &Capabilities,
    ) -> UpgradeResult<StrategyUsed> {
        let options = &self.plan.options;
        info!(app = %app.name, "begin rolling upgrade");

        self.apply_origin(&app.name).await?;

        let (units, pairs) = if options.pause {
            (order_units(self.client, app).await?, hacluster_pairs(app, snapshot)?)
        } else {
            (app.units.clone(), BTreeMap::new())
        };

        let action = options.upgrade_action.name();
        for unit in &units {
            if options.evacuate && app.name == COMPUTE_APPLICATION {
                warn!(app = %app.name, "evacuation is not implemented, skipping remaining units");
                break;
            }

            let subordinate = pairs.get(&unit.name);

            if options.pause {
                if let Some(sub) = subordinate {
                    self.pause_or_resume(sub, "pause").await?;
                }
                if capabilities.can_pause() {
                    self.pause_or_resume(unit, "pause").await?;
                }
            }

            if capabilities.supports(action) {
                info!(app = %app.name, unit = %unit.name, %action, "upgrading unit");
                self.run_action(
                    &unit.name,
                    action,
                    &options.upgrade_params,
                    self.timings.upgrade_timeout,
                )
                .await?;
                info!(app = %app.name, unit = %unit.name, "completed upgrade for unit");
            } else {
                warn!(app = %app.name, %action, "upgrade action not available, unit not upgraded");
            }

            if options.pause {
                if capabilities.can_resume() {
                    self.pause_or_resume(unit, "resume").await?;
                }
                if let Some(sub) = subordinate {
                    self.pause_or_resume(sub, "resume").await?;
                }
            }

            wait_until(self.client, &WaitScope::Fleet, &self.timings.fleet_wait()).await?;
            info!(app = %app.name, unit = %unit.name, "unit finished the upgrade");
        }

        info!(app = %app.name, "finished rolling upgrade");
        Ok(StrategyUsed::Rolling)
    }

    /// Upgrade every unit of `application` at once through its origin.
    pub async fn bulk(&self, application: &str) -> UpgradeResult<StrategyUsed> {
        let origin = &self.plan.options.origin;
        info!(app = %application, "big-bang upgrade");
        if self.dry_run() {
            return Ok(StrategyUsed::Bulk);
        }

        if !origin.is_empty() {
            let key = self.plan.origin_key(application);
            let config = self.client.get_config(application).await?;
            if !config.contains_key(key) {
                warn!(app = %application, %key, "unable to set origin during big-bang upgrade, skipping");
                return Ok(StrategyUsed::Skipped);
            }

            info!(app = %application, %key, %origin, "setting origin");
            let values = BTreeMap::from([(key.to_string(), origin.clone())]);
            self.client.set_config(application, &values).await?;
            tokio::time::sleep(self.timings.bulk_settle).await;
        }

        let timeout = self.timings.upgrade_timeout;
        tokio::time::timeout(timeout, self.wait_upgrade_messages(application))
            .await
            .map_err(|_| UpgradeError::BulkTimeout {
                application: application.to_string(),
                timeout,
            })??;
        Ok(StrategyUsed::Bulk)
    }

    async fn wait_upgrade_messages(&self, application: &str) -> UpgradeResult<()> {
        loop {
            let app = self.client.application(application).await?;
            let upgrading: Vec<&str> = app
                .units
                .iter()
                .filter(|u| u.workload_message.to_ascii_lowercase().contains(UPGRADE_IN_PROGRESS))
                .map(|u| u.name.as_str())
                .collect();
            if upgrading.is_empty() {
                return Ok(());
            }
            debug!(app = %application, units = ?upgrading, "upgrade in progress");
            tokio::time::sleep(self.timings.bulk_poll_interval).await;
        }
    }

    /// Set the origin and wait until it reads back.
    async fn apply_origin(&self, application: &str) -> UpgradeResult<()> {
        let origin = &self.plan.options.origin;
        if origin.is_empty() || self.dry_run() {
            return Ok(());
        }

        let key = self.plan.origin_key(application);
        let read = |config: &charmroll_client::ConfigMap| {
            config.get(key).cloned().flatten().unwrap_or_default()
        };

        let previous = read(&self.client.get_config(application).await?);
        if previous == *origin {
            info!(app = %application, %key, value = %previous, "origin already set");
            return Ok(());
        }

        let values = BTreeMap::from([(key.to_string(), origin.clone())]);
        self.client.set_config(application, &values).await?;

        for attempt in 1..=self.timings.config_poll_attempts {
            tokio::time::sleep(self.timings.config_poll_interval).await;
            let current = read(&self.client.get_config(application).await?);
            info!(app = %application, %key, %previous, %current, attempt, "setting origin");
            if current == *origin {
                return Ok(());
            }
        }

        warn!(app = %application, %key, %origin, "origin not visible after polling, continuing");
        Ok(())
    }

    async fn pause_or_resume(&self, unit: &UnitStatus, action: &str) -> UpgradeResult<()> {
        info!(unit = %unit.name, %action, "service action");
        self.run_action(&unit.name, action, &BTreeMap::new(), self.timings.pause_timeout)
            .await
    }

    /// Run an action under `timeout`. Skipped in dry runs.
    async fn run_action(
        &self,
        unit: &str,
        action: &str,
        params: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> UpgradeResult<()> {
        if self.dry_run() {
            debug!(%unit, %action, "dry run, action not sent");
            return Ok(());
        }

        let status = tokio::time::timeout(timeout, self.client.run_action(unit, action, params))
            .await
            .map_err(|_| UpgradeError::ActionTimeout {
                unit: unit.to_string(),
                action: action.to_string(),
                timeout,
            })??;
        debug!(%unit, %action, %status, "action finished");

        if !status.is_success() {
            return Err(UpgradeError::ActionFailed {
                unit: unit.to_string(),
                action: action.to_string(),
                status,
            });
        }
        Ok(())
    }
}
