//! The cluster client capability consumed by the orchestration crates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use charmroll_core::{ActionStatus, ApplicationStatus, CommandOutput, FleetSnapshot};

use crate::error::{ClientError, ClientResult};

/// Application configuration: key → current value (`None` when unset).
pub type ConfigMap = BTreeMap<String, Option<String>>;

/// Timeout for diagnostic reads such as the leadership query.
pub const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to an action queued on a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionHandle {
    pub id: String,
    pub unit: String,
    pub action: String,
}

/// Operations charmroll needs from the cluster controller.
///
/// Every method is a suspension point. Implementations must make
/// `is_connected` cheap and side-effect free, and `disconnect` idempotent.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Read the status of every application and machine in the model.
    async fn status(&self) -> ClientResult<FleetSnapshot>;

    async fn get_config(&self, application: &str) -> ClientResult<ConfigMap>;

    async fn set_config(
        &self,
        application: &str,
        values: &BTreeMap<String, String>,
    ) -> ClientResult<()>;

    /// Names of the actions the application's charm declares.
    async fn get_actions(&self, application: &str) -> ClientResult<BTreeSet<String>>;

    /// Upgrade the application's charm, optionally pinned to a revision.
    async fn upgrade_charm(&self, application: &str, revision: Option<u32>) -> ClientResult<()>;

    async fn add_relation(&self, endpoint_a: &str, endpoint_b: &str) -> ClientResult<()>;

    async fn run_command(
        &self,
        unit: &str,
        command: &str,
        timeout: Duration,
    ) -> ClientResult<CommandOutput>;

    async fn start_action(
        &self,
        unit: &str,
        action: &str,
        params: &BTreeMap<String, String>,
    ) -> ClientResult<ActionHandle>;

    /// Block until the action reaches a terminal state.
    async fn wait_action(&self, handle: &ActionHandle) -> ClientResult<ActionStatus>;

    /// Latest revision of `charm` published in the catalog.
    async fn latest_revision(&self, charm: &str) -> ClientResult<u32>;

    /// Deploy a bundle, returning the names of the deployed applications.
    async fn deploy(&self, bundle: &Path) -> ClientResult<Vec<String>>;

    async fn remove_application(&self, application: &str) -> ClientResult<()>;

    async fn remove_machine(&self, machine: &str, force: bool) -> ClientResult<()>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> ClientResult<()>;

    /// Whether `unit` is the elected leader of its application.
    async fn is_leader(&self, unit: &str) -> ClientResult<bool> {
        let output = self.run_command(unit, "is-leader", DIAGNOSTIC_TIMEOUT).await?;
        if output.exit_code != 0 {
            return Err(ClientError::Command(format!(
                "is-leader on {unit} exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim() == "True")
    }

    /// Queue an action and wait for it to finish.
    async fn run_action(
        &self,
        unit: &str,
        action: &str,
        params: &BTreeMap<String, String>,
    ) -> ClientResult<ActionStatus> {
        let handle = self.start_action(unit, action, params).await?;
        self.wait_action(&handle).await
    }

    /// Status of a single application.
    async fn application(&self, name: &str) -> ClientResult<ApplicationStatus> {
        self.status()
            .await?
            .applications
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| ClientError::NotFound(format!("application {name}")))
    }
}
