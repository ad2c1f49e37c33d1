//! In-memory cluster.
//!
//! A scriptable stand-in for a live controller: statuses can be queued
//! per unit or application, failures injected per operation, and every
//! call is journaled so tests can assert on ordering.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use charmroll_core::{
    ActionStatus, ApplicationStatus, CharmRef, CommandOutput, FleetSnapshot, MachineStatus,
    WorkloadStatus,
};

use crate::client::{ActionHandle, ClusterClient, ConfigMap};
use crate::error::{ClientError, ClientResult};

/// A call observed by the in-memory cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Status,
    GetConfig { application: String },
    SetConfig { application: String, values: BTreeMap<String, String> },
    GetActions { application: String },
    UpgradeCharm { application: String, revision: Option<u32> },
    AddRelation { a: String, b: String },
    RunCommand { unit: String, command: String },
    StartAction { unit: String, action: String, params: BTreeMap<String, String> },
    WaitAction { unit: String, action: String },
    LatestRevision { charm: String },
    Deploy { bundle: PathBuf },
    RemoveApplication { application: String },
    RemoveMachine { machine: String, force: bool },
    Disconnect,
}

/// A failure to inject. Cloned into a fresh `ClientError` on each use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Rejected(String),
    Command(String),
    Connection(String),
}

impl Fault {
    fn to_error(&self) -> ClientError {
        match self {
            Fault::Rejected(msg) => ClientError::Rejected(msg.clone()),
            Fault::Command(msg) => ClientError::Command(msg.clone()),
            Fault::Connection(msg) => ClientError::Connection(msg.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    snapshot: FleetSnapshot,
    config: BTreeMap<String, ConfigMap>,
    /// Config writes not yet visible: (reads remaining, values).
    pending_config: BTreeMap<String, (usize, BTreeMap<String, String>)>,
    config_lag: usize,
    actions: BTreeMap<String, BTreeSet<String>>,
    action_results: BTreeMap<String, ActionStatus>,
    leaders: BTreeSet<String>,
    catalog: BTreeMap<String, u32>,
    unit_scripts: BTreeMap<String, VecDeque<WorkloadStatus>>,
    app_scripts: BTreeMap<String, VecDeque<WorkloadStatus>>,
    message_scripts: BTreeMap<String, VecDeque<String>>,
    config_faults: BTreeMap<String, Fault>,
    upgrade_faults: BTreeMap<String, Fault>,
    relation_fault: Option<Fault>,
    status_faults: VecDeque<Fault>,
    bundles: BTreeMap<PathBuf, Vec<ApplicationStatus>>,
    disconnect_after_reads: Option<usize>,
    status_reads: usize,
    disconnected: bool,
    next_action: u64,
    calls: Vec<Call>,
}

/// In-memory implementation of [`ClusterClient`].
#[derive(Debug, Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Setup ──────────────────────────────────────────────────────

    pub fn with_application(self, app: ApplicationStatus) -> Self {
        self.lock().snapshot.applications.push(app);
        self
    }

    pub fn with_machine(self, id: &str, has_hardware: bool) -> Self {
        self.lock().snapshot.machines.push(MachineStatus {
            id: id.to_string(),
            has_hardware,
        });
        self
    }

    pub fn with_actions(self, application: &str, actions: &[&str]) -> Self {
        self.lock().actions.insert(
            application.to_string(),
            actions.iter().map(|a| a.to_string()).collect(),
        );
        self
    }

    /// Outcome reported by `wait_action` for `action` (default: completed).
    pub fn with_action_result(self, action: &str, status: ActionStatus) -> Self {
        self.lock().action_results.insert(action.to_string(), status);
        self
    }

    pub fn with_config(self, application: &str, key: &str, value: Option<&str>) -> Self {
        self.lock()
            .config
            .entry(application.to_string())
            .or_default()
            .insert(key.to_string(), value.map(str::to_string));
        self
    }

    /// Config writes become visible only after `reads` further reads.
    pub fn with_config_lag(self, reads: usize) -> Self {
        self.lock().config_lag = reads;
        self
    }

    pub fn with_leader(self, unit: &str) -> Self {
        self.lock().leaders.insert(unit.to_string());
        self
    }

    pub fn with_latest_revision(self, charm: &str, revision: u32) -> Self {
        self.lock().catalog.insert(charm.to_string(), revision);
        self
    }

    /// Statuses `unit` reports on successive status reads. The last one
    /// sticks.
    pub fn with_unit_script(self, unit: &str, statuses: &[WorkloadStatus]) -> Self {
        self.lock()
            .unit_scripts
            .insert(unit.to_string(), statuses.iter().copied().collect());
        self
    }

    pub fn with_app_script(self, application: &str, statuses: &[WorkloadStatus]) -> Self {
        self.lock()
            .app_scripts
            .insert(application.to_string(), statuses.iter().copied().collect());
        self
    }

    /// Workload messages `unit` reports on successive status reads.
    pub fn with_message_script(self, unit: &str, messages: &[&str]) -> Self {
        self.lock()
            .message_scripts
            .insert(unit.to_string(), messages.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn with_config_fault(self, application: &str, fault: Fault) -> Self {
        self.lock().config_faults.insert(application.to_string(), fault);
        self
    }

    pub fn with_upgrade_fault(self, application: &str, fault: Fault) -> Self {
        self.lock().upgrade_faults.insert(application.to_string(), fault);
        self
    }

    pub fn with_relation_fault(self, fault: Fault) -> Self {
        self.lock().relation_fault = Some(fault);
        self
    }

    /// Fail the next status reads, one fault per read.
    pub fn with_status_faults(self, faults: Vec<Fault>) -> Self {
        self.lock().status_faults = faults.into();
        self
    }

    pub fn with_bundle(self, path: &Path, apps: Vec<ApplicationStatus>) -> Self {
        self.lock().bundles.insert(path.to_path_buf(), apps);
        self
    }

    /// Drop the connection after `reads` successful status reads.
    pub fn disconnect_after(self, reads: usize) -> Self {
        self.lock().disconnect_after_reads = Some(reads);
        self
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn config_value(&self, application: &str, key: &str) -> Option<String> {
        self.lock()
            .config
            .get(application)
            .and_then(|c| c.get(key).cloned())
            .flatten()
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().disconnected = !connected;
    }

    fn record(inner: &mut Inner, call: Call) {
        debug!(?call, "memory cluster call");
        inner.calls.push(call);
    }

    fn ensure_connected(inner: &Inner) -> ClientResult<()> {
        if inner.disconnected {
            return Err(ClientError::Connection("memory cluster disconnected".into()));
        }
        Ok(())
    }
}

impl Inner {
    fn app_mut(&mut self, name: &str) -> ClientResult<&mut ApplicationStatus> {
        self.snapshot
            .applications
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| ClientError::NotFound(format!("application {name}")))
    }

    fn has_unit(&self, unit: &str) -> bool {
        self.snapshot
            .applications
            .iter()
            .any(|a| a.units.iter().any(|u| u.name == unit))
    }

    fn advance_scripts(&mut self) {
        let Inner {
            snapshot,
            unit_scripts,
            app_scripts,
            message_scripts,
            ..
        } = self;
        for app in &mut snapshot.applications {
            if let Some(status) = next_scripted(app_scripts.get_mut(&app.name)) {
                app.status = status;
            }
            for unit in &mut app.units {
                if let Some(status) = next_scripted(unit_scripts.get_mut(&unit.name)) {
                    unit.workload_status = status;
                }
                if let Some(message) = next_scripted(message_scripts.get_mut(&unit.name)) {
                    unit.workload_message = message;
                }
            }
        }
    }
}

/// Pop the next scripted value, keeping the final one in place.
fn next_scripted<T: Clone>(script: Option<&mut VecDeque<T>>) -> Option<T> {
    let script = script?;
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn status(&self) -> ClientResult<FleetSnapshot> {
        let mut inner = self.lock();
        Self::record(&mut inner, Call::Status);
        Self::ensure_connected(&inner)?;

        if let Some(fault) = inner.status_faults.pop_front() {
            if matches!(fault, Fault::Connection(_)) {
                inner.disconnected = true;
            }
            return Err(fault.to_error());
        }

        if let Some(limit) = inner.disconnect_after_reads {
            if inner.status_reads >= limit {
                inner.disconnected = true;
                return Err(ClientError::Connection("connection reset".into()));
            }
        }
        inner.status_reads += 1;
        inner.advance_scripts();
        Ok(inner.snapshot.clone())
    }

    async fn get_config(&self, application: &str) -> ClientResult<ConfigMap> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::GetConfig {
                application: application.to_string(),
            },
        );
        Self::ensure_connected(&inner)?;
        inner.app_mut(application)?;

        let mut visible = None;
        if let Some((remaining, values)) = inner.pending_config.get_mut(application) {
            if *remaining == 0 {
                visible = Some(values.clone());
            } else {
                *remaining -= 1;
            }
        }
        if let Some(values) = visible {
            inner.pending_config.remove(application);
            let config = inner.config.entry(application.to_string()).or_default();
            for (key, value) in values {
                config.insert(key, Some(value));
            }
        }

        Ok(inner.config.get(application).cloned().unwrap_or_default())
    }

    async fn set_config(
        &self,
        application: &str,
        values: &BTreeMap<String, String>,
    ) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::SetConfig {
                application: application.to_string(),
                values: values.clone(),
            },
        );
        Self::ensure_connected(&inner)?;
        inner.app_mut(application)?;
        if let Some(fault) = inner.config_faults.get(application) {
            return Err(fault.to_error());
        }

        if inner.config_lag > 0 {
            let lag = inner.config_lag;
            inner
                .pending_config
                .insert(application.to_string(), (lag, values.clone()));
        } else {
            let config = inner.config.entry(application.to_string()).or_default();
            for (key, value) in values {
                config.insert(key.clone(), Some(value.clone()));
            }
        }
        Ok(())
    }

    async fn get_actions(&self, application: &str) -> ClientResult<BTreeSet<String>> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::GetActions {
                application: application.to_string(),
            },
        );
        Self::ensure_connected(&inner)?;
        inner.app_mut(application)?;
        Ok(inner.actions.get(application).cloned().unwrap_or_default())
    }

    async fn upgrade_charm(&self, application: &str, revision: Option<u32>) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::UpgradeCharm {
                application: application.to_string(),
                revision,
            },
        );
        Self::ensure_connected(&inner)?;
        if let Some(fault) = inner.upgrade_faults.get(application) {
            return Err(fault.to_error());
        }

        let current = CharmRef::parse(&inner.app_mut(application)?.charm_url);
        let target = revision.or_else(|| inner.catalog.get(&current.name).copied());
        if let Some(target) = target {
            inner.app_mut(application)?.charm_url = current.at_revision(target).to_string();
        }
        Ok(())
    }

    async fn add_relation(&self, endpoint_a: &str, endpoint_b: &str) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::AddRelation {
                a: endpoint_a.to_string(),
                b: endpoint_b.to_string(),
            },
        );
        Self::ensure_connected(&inner)?;
        match &inner.relation_fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    async fn run_command(
        &self,
        unit: &str,
        command: &str,
        _timeout: Duration,
    ) -> ClientResult<CommandOutput> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::RunCommand {
                unit: unit.to_string(),
                command: command.to_string(),
            },
        );
        Self::ensure_connected(&inner)?;
        if !inner.has_unit(unit) {
            return Err(ClientError::NotFound(format!("unit {unit}")));
        }

        let stdout = if command == "is-leader" {
            let leader = if inner.leaders.contains(unit) { "True" } else { "False" };
            format!("{leader}\n")
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn start_action(
        &self,
        unit: &str,
        action: &str,
        params: &BTreeMap<String, String>,
    ) -> ClientResult<ActionHandle> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::StartAction {
                unit: unit.to_string(),
                action: action.to_string(),
                params: params.clone(),
            },
        );
        Self::ensure_connected(&inner)?;
        if !inner.has_unit(unit) {
            return Err(ClientError::NotFound(format!("unit {unit}")));
        }
        inner.next_action += 1;
        Ok(ActionHandle {
            id: inner.next_action.to_string(),
            unit: unit.to_string(),
            action: action.to_string(),
        })
    }

    async fn wait_action(&self, handle: &ActionHandle) -> ClientResult<ActionStatus> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::WaitAction {
                unit: handle.unit.clone(),
                action: handle.action.clone(),
            },
        );
        Self::ensure_connected(&inner)?;
        Ok(inner
            .action_results
            .get(&handle.action)
            .cloned()
            .unwrap_or(ActionStatus::Completed))
    }

    async fn latest_revision(&self, charm: &str) -> ClientResult<u32> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::LatestRevision {
                charm: charm.to_string(),
            },
        );
        inner
            .catalog
            .get(charm)
            .copied()
            .ok_or_else(|| ClientError::Catalog(format!("no catalog entry for {charm}")))
    }

    async fn deploy(&self, bundle: &Path) -> ClientResult<Vec<String>> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::Deploy {
                bundle: bundle.to_path_buf(),
            },
        );
        Self::ensure_connected(&inner)?;
        let apps = inner
            .bundles
            .get(bundle)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("bundle {}", bundle.display())))?;
        let names = apps.iter().map(|a| a.name.clone()).collect();
        inner.snapshot.applications.extend(apps);
        Ok(names)
    }

    async fn remove_application(&self, application: &str) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::RemoveApplication {
                application: application.to_string(),
            },
        );
        Self::ensure_connected(&inner)?;
        inner.app_mut(application)?;
        inner.snapshot.applications.retain(|a| a.name != application);
        Ok(())
    }

    async fn remove_machine(&self, machine: &str, force: bool) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            Call::RemoveMachine {
                machine: machine.to_string(),
                force,
            },
        );
        Self::ensure_connected(&inner)?;
        let before = inner.snapshot.machines.len();
        inner.snapshot.machines.retain(|m| m.id != machine);
        if inner.snapshot.machines.len() == before {
            return Err(ClientError::NotFound(format!("machine {machine}")));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.lock().disconnected
    }

    async fn disconnect(&self) -> ClientResult<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, Call::Disconnect);
        inner.disconnected = true;
        Ok(())
    }
}
