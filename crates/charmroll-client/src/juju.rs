//! Cluster client backed by the `juju` command-line tool.
//!
//! Every operation shells out to `juju … --format=json` and parses the
//! result. Catalog lookups use the `charm` tool. Remote connections
//! (endpoint + credentials) get a private `JUJU_DATA` directory holding
//! generated controller, account and model files, removed on disconnect.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, info, warn};

use charmroll_core::{
    ActionStatus, ApplicationStatus, CharmRef, CommandOutput, FleetSnapshot, MachineStatus,
    RelationInfo, UnitStatus, WorkloadStatus,
};

use crate::client::{ActionHandle, ClusterClient, ConfigMap};
use crate::connect::ConnectOptions;
use crate::error::{ClientError, ClientResult};

/// Name given to the controller in a generated `JUJU_DATA`.
const REMOTE_CONTROLLER: &str = "charmroll-remote";

/// stderr fragments that mean the controller link is gone.
const CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection is shut down",
    "closed network connection",
    "cannot connect",
    "no route to host",
    "no such host",
    "i/o timeout",
    "context deadline exceeded",
    "unexpected EOF",
];

/// stderr fragments for a missing application, unit, machine or action.
const NOT_FOUND_MARKERS: &[&str] = &["not found", "does not exist"];

/// stderr fragments for a request the controller understood and refused.
const REJECTION_MARKERS: &[&str] = &[
    "already exists",
    "No such file",
    "permission denied",
    "unauthorized",
    "not supported",
    "invalid",
    "cannot ",
];

/// Upper bound on a single `juju` invocation.
const CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on a catalog lookup.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time given to `juju run` beyond its own `--timeout`.
const COMMAND_GRACE: Duration = Duration::from_secs(15);

/// Client driving the `juju` binary.
#[derive(Debug)]
pub struct JujuCli {
    juju: PathBuf,
    charm_tool: PathBuf,
    model: Option<String>,
    data_dir: Mutex<Option<tempfile::TempDir>>,
    data_path: Option<PathBuf>,
    connected: AtomicBool,
    call_timeout: Duration,
    catalog_timeout: Duration,
}

impl JujuCli {
    fn new(options: &ConnectOptions) -> Self {
        Self {
            juju: options.juju_binary.clone().unwrap_or_else(|| PathBuf::from("juju")),
            charm_tool: options.charm_binary.clone().unwrap_or_else(|| PathBuf::from("charm")),
            model: None,
            data_dir: Mutex::new(None),
            data_path: None,
            connected: AtomicBool::new(true),
            call_timeout: CALL_TIMEOUT,
            catalog_timeout: CATALOG_TIMEOUT,
        }
    }

    /// Resolve the target model and verify the controller answers.
    pub async fn connect(options: &ConnectOptions) -> ClientResult<Self> {
        let mut client = Self::new(options);

        if options.is_remote() {
            let (dir, model) = write_remote_data(options)?;
            client.data_path = Some(dir.path().to_path_buf());
            client.model = Some(model);
            *client.data_dir.lock().unwrap_or_else(PoisonError::into_inner) = Some(dir);
        } else if let Some(selector) = options.model_selector() {
            client.model = Some(selector);
        } else if let Some(controller) = &options.controller {
            let models = client
                .juju_json(&["models", "--controller", controller, "--format=json"])
                .await?;
            let current = models
                .get("current-model")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::NotFound(format!("current model on {controller}")))?;
            client.model = Some(format!("{controller}:{current}"));
        }

        client.status().await?;
        info!(model = client.model.as_deref().unwrap_or("current"), "connected to controller");
        Ok(client)
    }

    fn model_args(&self) -> Vec<String> {
        match &self.model {
            Some(model) => vec!["-m".to_string(), model.clone()],
            None => Vec::new(),
        }
    }

    /// Run `program`, killing it once `limit` has passed.
    async fn exec(&self, program: &Path, args: &[String], limit: Duration) -> ClientResult<String> {
        debug!(program = %program.display(), ?args, "exec");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(data) = &self.data_path {
            cmd.env("JUJU_DATA", data);
        }

        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                let subcommand = args.first().map(String::as_str).unwrap_or_default();
                warn!(program = %program.display(), %subcommand, ?limit, "command timed out");
                return Err(ClientError::Timeout(format!(
                    "{} {subcommand} after {}s",
                    program.display(),
                    limit.as_secs_f64()
                )));
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let err = classify_failure(stderr, output.status.code());
        if err.is_connection() {
            self.connected.store(false, Ordering::SeqCst);
        }
        Err(err)
    }

    /// Run `juju <subcommand> -m <model> <rest…>`.
    async fn juju(&self, subcommand: &str, rest: &[&str]) -> ClientResult<String> {
        self.juju_within(subcommand, rest, self.call_timeout).await
    }

    async fn juju_within(
        &self,
        subcommand: &str,
        rest: &[&str],
        limit: Duration,
    ) -> ClientResult<String> {
        let mut args = vec![subcommand.to_string()];
        args.extend(self.model_args());
        args.extend(rest.iter().map(|s| s.to_string()));
        self.exec(&self.juju, &args, limit).await
    }

    /// Run a model-less `juju` command and parse JSON output.
    async fn juju_json(&self, args: &[&str]) -> ClientResult<Value> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let out = self.exec(&self.juju, &args, self.call_timeout).await?;
        parse_json(&out)
    }

    async fn juju_model_json(&self, subcommand: &str, rest: &[&str]) -> ClientResult<Value> {
        let out = self.juju(subcommand, rest).await?;
        parse_json(&out)
    }
}

#[async_trait]
impl ClusterClient for JujuCli {
    async fn status(&self) -> ClientResult<FleetSnapshot> {
        let value = self.juju_model_json("status", &["--format=json"]).await?;
        parse_status(&value)
    }

    async fn get_config(&self, application: &str) -> ClientResult<ConfigMap> {
        let value = self
            .juju_model_json("config", &[application, "--format=json"])
            .await?;
        Ok(parse_config(&value))
    }

    async fn set_config(
        &self,
        application: &str,
        values: &BTreeMap<String, String>,
    ) -> ClientResult<()> {
        let pairs: Vec<String> = values.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut rest = vec![application];
        rest.extend(pairs.iter().map(String::as_str));
        self.juju("config", &rest).await.map(|_| ())
    }

    async fn get_actions(&self, application: &str) -> ClientResult<BTreeSet<String>> {
        let value = self
            .juju_model_json("actions", &[application, "--format=json"])
            .await?;
        Ok(value
            .as_object()
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn upgrade_charm(&self, application: &str, revision: Option<u32>) -> ClientResult<()> {
        let revision = revision.map(|r| r.to_string());
        let mut rest = vec![application];
        if let Some(rev) = &revision {
            rest.extend(["--revision", rev.as_str()]);
        }
        self.juju("upgrade-charm", &rest).await.map(|_| ())
    }

    async fn add_relation(&self, endpoint_a: &str, endpoint_b: &str) -> ClientResult<()> {
        self.juju("add-relation", &[endpoint_a, endpoint_b])
            .await
            .map(|_| ())
    }

    async fn run_command(
        &self,
        unit: &str,
        command: &str,
        timeout: Duration,
    ) -> ClientResult<CommandOutput> {
        let timeout_arg = format!("{}s", timeout.as_secs().max(1));
        let run_args = [
            "--unit",
            unit,
            "--timeout",
            timeout_arg.as_str(),
            "--format=json",
            "--",
            command,
        ];
        let out = self
            .juju_within("run", &run_args, timeout + COMMAND_GRACE)
            .await?;
        parse_command_output(&parse_json(&out)?)
    }

    async fn start_action(
        &self,
        unit: &str,
        action: &str,
        params: &BTreeMap<String, String>,
    ) -> ClientResult<ActionHandle> {
        let pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut rest = vec![unit, action];
        rest.extend(pairs.iter().map(String::as_str));
        rest.push("--format=json");
        let value = self.juju_model_json("run-action", &rest).await?;
        let id = find_action_id(&value)
            .ok_or_else(|| ClientError::Parse(format!("no action id in {value}")))?;
        debug!(%unit, %action, %id, "action queued");
        Ok(ActionHandle {
            id,
            unit: unit.to_string(),
            action: action.to_string(),
        })
    }

    async fn wait_action(&self, handle: &ActionHandle) -> ClientResult<ActionStatus> {
        let value = self
            .juju_model_json(
                "show-action-output",
                &[&handle.id, "--wait", "0", "--format=json"],
            )
            .await?;
        let status = find_string(&value, "status")
            .ok_or_else(|| ClientError::Parse(format!("no status for action {}", handle.id)))?;
        Ok(ActionStatus::parse(&status))
    }

    async fn latest_revision(&self, charm: &str) -> ClientResult<u32> {
        let args = vec![
            "show".to_string(),
            format!("cs:{charm}"),
            "id".to_string(),
            "--format=json".to_string(),
        ];
        let out = self
            .exec(&self.charm_tool, &args, self.catalog_timeout)
            .await
            .map_err(|e| match e {
                ClientError::Timeout(_) => e,
                other => ClientError::Catalog(other.to_string()),
            })?;
        let value = parse_json(&out).map_err(|e| ClientError::Catalog(e.to_string()))?;
        let id = find_string(&value, "Id")
            .ok_or_else(|| ClientError::Catalog(format!("no id for {charm}")))?;
        CharmRef::parse(&id)
            .revision
            .ok_or_else(|| ClientError::Catalog(format!("no revision in {id}")))
    }

    async fn deploy(&self, bundle: &Path) -> ClientResult<Vec<String>> {
        let names = bundle_applications(bundle)?;
        let path = bundle.to_string_lossy().into_owned();
        self.juju("deploy", &[&path]).await?;
        Ok(names)
    }

    async fn remove_application(&self, application: &str) -> ClientResult<()> {
        self.juju("remove-application", &[application])
            .await
            .map(|_| ())
    }

    async fn remove_machine(&self, machine: &str, force: bool) -> ClientResult<()> {
        let mut rest = vec![machine];
        if force {
            rest.push("--force");
        }
        self.juju("remove-machine", &rest).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> ClientResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let dir = self
            .data_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dir) = dir {
            if let Err(e) = dir.close() {
                warn!(error = %e, "failed to remove generated juju data directory");
            }
        }
        debug!("disconnected");
        Ok(())
    }
}

/// Map a failed invocation to an error, most specific first. Failures
/// matching no known marker are command errors, not rejections.
fn classify_failure(stderr: String, code: Option<i32>) -> ClientError {
    let matches = |markers: &[&str]| markers.iter().any(|m| stderr.contains(m));
    if matches(CONNECTION_MARKERS) {
        ClientError::Connection(stderr)
    } else if matches(NOT_FOUND_MARKERS) {
        ClientError::NotFound(stderr)
    } else if matches(REJECTION_MARKERS) {
        ClientError::Rejected(stderr)
    } else if stderr.is_empty() {
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        ClientError::Command(format!("exited with {code}"))
    } else {
        ClientError::Command(stderr)
    }
}

// ── Output parsing ─────────────────────────────────────────────────

fn parse_json(out: &str) -> ClientResult<Value> {
    serde_json::from_str(out).map_err(|e| ClientError::Parse(e.to_string()))
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

fn parse_unit(name: &str, unit: &Value) -> UnitStatus {
    UnitStatus {
        name: name.to_string(),
        workload_status: str_at(unit, &["workload-status", "current"])
            .map(WorkloadStatus::parse)
            .unwrap_or(WorkloadStatus::Unknown),
        workload_message: str_at(unit, &["workload-status", "message"])
            .unwrap_or_default()
            .to_string(),
        public_address: str_at(unit, &["public-address"]).map(str::to_string),
        machine: str_at(unit, &["machine"]).map(str::to_string),
    }
}

/// Convert `juju status --format=json` into a snapshot.
///
/// Subordinate units only appear nested under their principal units, so
/// they are collected from there. Status output names relation
/// endpoints, not interfaces; subordinate charms provide the interface
/// they are named after (`hacluster`), so for subordinate relations the
/// remote charm name stands in for the interface.
pub fn parse_status(value: &Value) -> ClientResult<FleetSnapshot> {
    let apps = value
        .get("applications")
        .and_then(Value::as_object)
        .ok_or_else(|| ClientError::Parse("status output has no applications".into()))?;

    let subordinate_of = |remote: &str, principal: &str| -> bool {
        apps.get(remote)
            .and_then(|a| a.get("subordinate-to"))
            .and_then(Value::as_array)
            .is_some_and(|list| list.iter().any(|p| p.as_str() == Some(principal)))
    };
    let charm_name = |app: &str| -> Option<String> {
        let app = apps.get(app)?;
        app.get("charm-name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| app.get("charm").and_then(Value::as_str).map(|c| CharmRef::parse(c).name))
    };

    // Subordinate units, keyed by their application.
    let mut nested: BTreeMap<String, Vec<UnitStatus>> = BTreeMap::new();
    for app in apps.values() {
        let Some(units) = app.get("units").and_then(Value::as_object) else {
            continue;
        };
        for unit in units.values() {
            let Some(subs) = unit.get("subordinates").and_then(Value::as_object) else {
                continue;
            };
            for (sub_name, sub) in subs {
                let owner = sub_name.split('/').next().unwrap_or(sub_name).to_string();
                nested.entry(owner).or_default().push(parse_unit(sub_name, sub));
            }
        }
    }

    let mut applications = Vec::with_capacity(apps.len());
    for (name, app) in apps {
        let mut units: Vec<UnitStatus> = app
            .get("units")
            .and_then(Value::as_object)
            .map(|units| units.iter().map(|(n, u)| parse_unit(n, u)).collect())
            .unwrap_or_default();
        if units.is_empty() {
            units = nested.remove(name).unwrap_or_default();
        }

        let mut relations = Vec::new();
        if let Some(rels) = app.get("relations").and_then(Value::as_object) {
            for (endpoint, remotes) in rels {
                for remote in remotes.as_array().into_iter().flatten().filter_map(Value::as_str) {
                    let subordinate = subordinate_of(remote, name);
                    let interface = if subordinate {
                        charm_name(remote).unwrap_or_else(|| endpoint.clone())
                    } else {
                        endpoint.clone()
                    };
                    relations.push(RelationInfo {
                        endpoint: endpoint.clone(),
                        interface,
                        remote_application: remote.to_string(),
                        subordinate,
                    });
                }
            }
        }

        applications.push(ApplicationStatus {
            name: name.clone(),
            status: str_at(app, &["application-status", "current"])
                .map(WorkloadStatus::parse)
                .unwrap_or(WorkloadStatus::Unknown),
            status_message: str_at(app, &["application-status", "message"])
                .unwrap_or_default()
                .to_string(),
            charm_url: str_at(app, &["charm"]).unwrap_or_default().to_string(),
            workload_version: str_at(app, &["version"]).map(str::to_string),
            units,
            relations,
        });
    }

    let machines = value
        .get("machines")
        .and_then(Value::as_object)
        .map(|machines| {
            machines
                .iter()
                .map(|(id, m)| MachineStatus {
                    id: id.clone(),
                    has_hardware: str_at(m, &["hardware"]).is_some_and(|h| h.contains("arch=")),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(FleetSnapshot {
        applications,
        machines,
    })
}

/// Convert `juju config APP --format=json` into key → value.
pub fn parse_config(value: &Value) -> ConfigMap {
    let Some(settings) = value.get("settings").and_then(Value::as_object) else {
        return ConfigMap::new();
    };
    settings
        .iter()
        .map(|(key, option)| {
            let value = match option.get("value") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            };
            (key.clone(), value)
        })
        .collect()
}

/// `juju run --format=json` prints one entry per unit.
fn parse_command_output(value: &Value) -> ClientResult<CommandOutput> {
    let entry = match value {
        Value::Array(items) => items.first(),
        Value::Object(_) => Some(value),
        _ => None,
    }
    .ok_or_else(|| ClientError::Parse(format!("no command result in {value}")))?;

    let exit_code = ["ReturnCode", "Code", "return-code"]
        .iter()
        .find_map(|k| entry.get(*k).and_then(Value::as_i64))
        .unwrap_or(0) as i32;
    let field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| entry.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    };
    Ok(CommandOutput {
        exit_code,
        stdout: field(&["Stdout", "stdout"]),
        stderr: field(&["Stderr", "stderr"]),
    })
}

/// First string value under `key`, searching depth-first.
fn find_string(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key).and_then(Value::as_str) {
                return Some(found.to_string());
            }
            map.values().find_map(|v| find_string(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_string(v, key)),
        _ => None,
    }
}

/// Action ids come back as `{"Action queued with id": "12"}` or nested
/// under the unit as `{"id": "12"}` depending on the client version.
fn find_action_id(value: &Value) -> Option<String> {
    if let Some(id) = find_string(value, "id") {
        return Some(id);
    }
    value.as_object()?.iter().find_map(|(k, v)| {
        if k.to_ascii_lowercase().contains("id") {
            v.as_str().map(|s| s.trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Application names declared in a bundle file or directory.
fn bundle_applications(bundle: &Path) -> ClientResult<Vec<String>> {
    let file = if bundle.is_dir() {
        bundle.join("bundle.yaml")
    } else {
        bundle.to_path_buf()
    };
    let content = std::fs::read_to_string(&file)?;
    let doc: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(&content).map_err(|e| ClientError::Parse(e.to_string()))?;
    let apps = doc
        .get("applications")
        .or_else(|| doc.get("services"))
        .and_then(serde_yaml_ng::Value::as_mapping)
        .ok_or_else(|| ClientError::Parse(format!("{} declares no applications", file.display())))?;
    Ok(apps
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect())
}

/// Write a private `JUJU_DATA` for a remote controller and return it
/// with the model selector to use.
fn write_remote_data(options: &ConnectOptions) -> ClientResult<(tempfile::TempDir, String)> {
    let endpoint = options.endpoint.clone().unwrap_or_default();
    let uuid = options
        .model
        .clone()
        .ok_or_else(|| ClientError::NotFound("model uuid is required with an endpoint".into()))?;
    let user = options.username.clone().unwrap_or_else(|| "admin".to_string());
    let model = format!("{user}/{uuid}");

    let controllers = json!({
        "controllers": {
            REMOTE_CONTROLLER: {
                "api-endpoints": [endpoint],
                "ca-cert": options.cacert.clone().unwrap_or_default(),
            }
        },
        "current-controller": REMOTE_CONTROLLER,
    });
    let accounts = json!({
        "controllers": {
            REMOTE_CONTROLLER: {
                "user": user,
                "password": options.password.clone().unwrap_or_default(),
            }
        }
    });
    let models = json!({
        "controllers": {
            REMOTE_CONTROLLER: {
                "models": { model.as_str(): { "uuid": uuid, "type": "iaas" } },
                "current-model": model,
            }
        }
    });

    let dir = tempfile::tempdir()?;
    for (file, doc) in [
        ("controllers.yaml", &controllers),
        ("accounts.yaml", &accounts),
        ("models.yaml", &models),
    ] {
        let yaml = serde_yaml_ng::to_string(doc).map_err(|e| ClientError::Parse(e.to_string()))?;
        std::fs::write(dir.path().join(file), yaml)?;
    }
    Ok((dir, format!("{REMOTE_CONTROLLER}:{model}")))
}
