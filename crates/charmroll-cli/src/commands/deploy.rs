use std::path::{Path, PathBuf};

use clap::Args;
use tracing::{info, warn};

use charmroll_client::ClusterClient;
use charmroll_converge::{ConvergencePolicy, WaitScope, wait_until};
use charmroll_core::StatusSummary;

use super::ConnectArgs;

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Bundle file to deploy.
    pub bundle: PathBuf,
    /// Wait for the deployed applications to settle.
    #[arg(long)]
    pub wait: bool,
}

pub async fn execute(args: DeployArgs) -> anyhow::Result<()> {
    let (client, deadline) = args.connect.open().await?;
    let work = run(&client, &args.bundle, args.wait);
    super::bounded(&client, deadline, work).await
}

/// Deploy `bundle`, optionally wait, and log the resulting model.
pub async fn run<C>(client: &C, bundle: &Path, wait: bool) -> anyhow::Result<()>
where
    C: ClusterClient + ?Sized,
{
    let before = client.status().await?;
    info!(
        machines = before.machines.len(),
        applications = before.applications.len(),
        "CURRENT"
    );

    info!(bundle = %bundle.display(), "deploying bundle");
    let deployed = match client.deploy(bundle).await {
        Ok(apps) => apps,
        Err(e) if e.is_rejection() => {
            warn!(bundle = %bundle.display(), error = %e, "deploy rejected");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    if wait && !deployed.is_empty() {
        let scope = WaitScope::applications(deployed.iter().cloned());
        wait_until(client, &scope, &ConvergencePolicy::simple()).await?;
    }

    let after = client.status().await?;
    let summary = StatusSummary::of(&after.applications);
    info!(
        machines = after.machines.len(),
        applications = after.applications.len(),
        status = ?summary.applications,
        deployed = %deployed.join(", "),
        "DEPLOYED"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use charmroll_client::{Call, MemoryCluster};
    use charmroll_core::{ApplicationStatus, UnitStatus, WorkloadStatus};

    fn bundle_apps() -> Vec<ApplicationStatus> {
        vec![
            ApplicationStatus::new("keystone", "cs:xenial/keystone-270")
                .with_unit(UnitStatus::new("keystone/0", WorkloadStatus::Active)),
            ApplicationStatus::new("glance", "cs:xenial/glance-10")
                .with_unit(UnitStatus::new("glance/0", WorkloadStatus::Active)),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn deploys_and_waits_for_bundle() {
        let path = Path::new("/bundles/openstack.yaml");
        let cluster = MemoryCluster::new()
            .with_machine("0", true)
            .with_bundle(path, bundle_apps())
            .with_unit_script("glance/0", &[WorkloadStatus::Maintenance, WorkloadStatus::Active]);

        run(&cluster, path, true).await.unwrap();

        let snapshot = cluster.snapshot();
        assert!(snapshot.contains("keystone"));
        assert!(snapshot.contains("glance"));
        assert!(cluster.calls().contains(&Call::Deploy {
            bundle: path.to_path_buf()
        }));
    }

    #[tokio::test]
    async fn missing_bundle_is_logged_not_fatal() {
        let cluster = MemoryCluster::new();
        run(&cluster, Path::new("/bundles/missing.yaml"), true)
            .await
            .unwrap();
        assert!(cluster.snapshot().applications.is_empty());
    }

    #[tokio::test]
    async fn lost_connection_is_fatal() {
        let cluster = MemoryCluster::new();
        cluster.set_connected(false);
        assert!(run(&cluster, Path::new("/bundles/openstack.yaml"), false).await.is_err());
    }
}
