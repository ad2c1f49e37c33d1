use clap::Args;
use tracing::{info, warn};

use charmroll_client::ClusterClient;
use charmroll_converge::{ConvergencePolicy, WaitScope, wait_until};

use super::ConnectArgs;

#[derive(Args, Debug, Clone)]
pub struct CleanArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Application to keep (repeatable).
    #[arg(long, value_name = "APP")]
    pub ignore: Vec<String>,
    /// Also remove provisioned machines (only without --ignore).
    #[arg(long)]
    pub force: bool,
    /// Wait until the model is empty (only without --ignore).
    #[arg(long)]
    pub wait: bool,
    /// Log what would be removed without removing it.
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(args: CleanArgs) -> anyhow::Result<()> {
    let (client, deadline) = args.connect.open().await?;
    let work = run(&client, &args);
    super::bounded(&client, deadline, work).await
}

/// Remove everything `args` selects from the model.
pub async fn run<C>(client: &C, args: &CleanArgs) -> anyhow::Result<()>
where
    C: ClusterClient + ?Sized,
{
    let snapshot = client.status().await?;
    let whole_model = args.ignore.is_empty();

    for app in &snapshot.applications {
        if args.ignore.contains(&app.name) {
            info!(app = %app.name, "keeping");
            continue;
        }
        if args.dry_run {
            info!(app = %app.name, "would remove application");
            continue;
        }
        info!(app = %app.name, "removing application");
        match client.remove_application(&app.name).await {
            Ok(()) => {}
            Err(e) if e.is_rejection() => {
                warn!(app = %app.name, error = %e, "removal rejected");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if args.force && whole_model {
        for machine in snapshot.machines.iter().filter(|m| m.has_hardware) {
            if args.dry_run {
                info!(machine = %machine.id, "would remove machine");
                continue;
            }
            info!(machine = %machine.id, "removing machine");
            if let Err(e) = client.remove_machine(&machine.id, true).await {
                warn!(machine = %machine.id, error = %e, "failed to remove machine");
            }
        }
    }

    if args.wait && whole_model && !args.dry_run {
        wait_until(client, &WaitScope::Fleet, &ConvergencePolicy::drained()).await?;
        info!("model is empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use charmroll_client::{Call, MemoryCluster};
    use charmroll_core::{ApplicationStatus, UnitStatus, WorkloadStatus};
    use std::time::Duration;

    fn model_with(machines: &[(&str, bool)]) -> MemoryCluster {
        let cluster = ["keystone", "glance", "mysql"].iter().fold(MemoryCluster::new(), |cluster, name| {
            cluster.with_application(
                ApplicationStatus::new(name, &format!("cs:xenial/{name}-1"))
                    .with_unit(UnitStatus::new(&format!("{name}/0"), WorkloadStatus::Active)),
            )
        });
        machines
            .iter()
            .fold(cluster, |cluster, (id, hardware)| cluster.with_machine(id, *hardware))
    }

    fn model() -> MemoryCluster {
        model_with(&[("0", true), ("1", true), ("2", false)])
    }

    fn clean(ignore: &[&str]) -> CleanArgs {
        CleanArgs {
            connect: Default::default(),
            ignore: ignore.iter().map(|s| s.to_string()).collect(),
            force: false,
            wait: false,
            dry_run: false,
        }
    }

    fn removed_machines(cluster: &MemoryCluster) -> Vec<String> {
        cluster
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RemoveMachine { machine, .. } => Some(machine),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn ignored_apps_survive() {
        let cluster = model();
        let args = CleanArgs {
            force: true,
            ..clean(&["mysql"])
        };
        run(&cluster, &args).await.unwrap();

        assert_eq!(cluster.snapshot().application_names(), vec!["mysql".to_string()]);
        // Machines stay when anything is kept.
        assert!(removed_machines(&cluster).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unprovisioned_machine_blocks_drain() {
        let cluster = model();
        let args = CleanArgs {
            force: true,
            wait: true,
            ..clean(&[])
        };
        // Unprovisioned machines are never removed, so the model cannot drain.
        let result = tokio::time::timeout(Duration::from_secs(60), run(&cluster, &args)).await;
        assert!(result.is_err());
        assert_eq!(removed_machines(&cluster), vec!["0".to_string(), "1".to_string()]);
        assert!(cluster.snapshot().applications.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_drained() {
        let cluster = model_with(&[("0", true), ("1", true)]);
        let args = CleanArgs {
            force: true,
            wait: true,
            ..clean(&[])
        };
        run(&cluster, &args).await.unwrap();
        assert!(cluster.snapshot().is_drained());
    }

    #[tokio::test]
    async fn dry_run_removes_nothing() {
        let cluster = model();
        let args = CleanArgs {
            force: true,
            wait: true,
            dry_run: true,
            ..clean(&[])
        };
        run(&cluster, &args).await.unwrap();

        assert_eq!(cluster.snapshot().applications.len(), 3);
        assert!(!cluster.calls().iter().any(|c| matches!(
            c,
            Call::RemoveApplication { .. } | Call::RemoveMachine { .. }
        )));
    }
}
