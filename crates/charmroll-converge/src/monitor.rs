//! The convergence poll loop.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use charmroll_client::{ClientError, ClusterClient};
use charmroll_core::{FleetSnapshot, StatusSummary, WorkloadStatus};

use crate::error::{ConvergeError, ConvergeResult};
use crate::policy::{ConvergencePolicy, Stability, WaitScope};
use crate::tracker::{ConvergenceTracker, Progress};

/// Block until `scope` converges under `policy`.
///
/// Returns the snapshot that completed convergence. A closed connection
/// wins over every other outcome, including an expired deadline.
pub async fn wait_until<C>(
    client: &C,
    scope: &WaitScope,
    policy: &ConvergencePolicy,
) -> ConvergeResult<FleetSnapshot>
where
    C: ClusterClient + ?Sized,
{
    debug!(?scope, stability = ?policy.stability, "waiting for convergence");
    tokio::time::sleep(policy.initial_delay).await;

    let outcome = match policy.deadline {
        Some(deadline) => {
            match tokio::time::timeout(deadline, poll(client, scope, policy)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ConvergeError::Timeout(deadline)),
            }
        }
        None => poll(client, scope, policy).await,
    };

    match outcome {
        Err(ConvergeError::Timeout(_)) if !client.is_connected() => {
            Err(ConvergeError::ConnectionClosed)
        }
        other => other,
    }
}

async fn poll<C>(
    client: &C,
    scope: &WaitScope,
    policy: &ConvergencePolicy,
) -> ConvergeResult<FleetSnapshot>
where
    C: ClusterClient + ?Sized,
{
    let mut tracker = ConvergenceTracker::new(policy);

    loop {
        if !client.is_connected() {
            return Err(ConvergeError::ConnectionClosed);
        }

        match client.status().await {
            Ok(snapshot) => match tracker.observe(&snapshot, scope) {
                Progress::Converged => {
                    if !client.is_connected() {
                        return Err(ConvergeError::ConnectionClosed);
                    }
                    log_summary("[DONE]", &snapshot, scope, policy);
                    return Ok(snapshot);
                }
                Progress::ErrorBudgetExhausted { applications } => {
                    log_errors(&snapshot, &applications);
                    return Err(ConvergeError::ApplicationErrorTimeout {
                        applications,
                        elapsed: tracker.error_elapsed(),
                    });
                }
                Progress::Waiting => {
                    if tracker.log_due() {
                        log_summary("[WAITING]", &snapshot, scope, policy);
                    }
                }
            },
            Err(e) if e.is_connection() => return Err(ConvergeError::ConnectionClosed),
            Err(e @ ClientError::Io(_)) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "status read failed");
                tracker.observe_failure();
            }
        }

        tokio::time::sleep(policy.wait_period).await;
    }
}

fn log_summary(label: &str, snapshot: &FleetSnapshot, scope: &WaitScope, policy: &ConvergencePolicy) {
    match policy.stability {
        Stability::Drained => {
            let machines: Vec<&str> = snapshot.machines.iter().map(|m| m.id.as_str()).collect();
            info!(
                machines = snapshot.machines.len(),
                ids = %machines.join(", "),
                applications = snapshot.applications.len(),
                "{label} model contents"
            );
        }
        Stability::Settled { .. } => {
            let summary = StatusSummary::of(scope.select(snapshot));
            info!(
                applications = ?summary.applications,
                units = ?summary.units,
                "{label} workload status"
            );
        }
    }
}

fn log_errors(snapshot: &FleetSnapshot, applications: &[String]) {
    for app in snapshot.applications.iter().filter(|a| applications.contains(&a.name)) {
        let messages: BTreeMap<&str, &str> = app
            .units
            .iter()
            .filter(|u| u.workload_status == WorkloadStatus::Error)
            .map(|u| (u.name.as_str(), u.workload_message.as_str()))
            .collect();
        error!(
            app = %app.name,
            status = %app.status,
            message = %app.status_message,
            units = ?messages,
            "[ERROR] application stuck in error"
        );
    }
    let summary = StatusSummary::of(&snapshot.applications);
    error!(
        applications = ?summary.applications,
        units = ?summary.units,
        "[ERROR] workload status"
    );
}
