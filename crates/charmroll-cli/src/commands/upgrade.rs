use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use tracing::{error, info};

use charmroll_client::ClusterClient;
use charmroll_core::plan::{DEFAULT_ORIGIN, parse_key_values};
use charmroll_core::{UpgradeAction, UpgradeOptions, UpgradePlan, UpgradeSettings};
use charmroll_upgrade::{Orchestrator, UpgradeReport};

use super::ConnectArgs;

#[derive(Args, Debug, Clone)]
pub struct UpgradeArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Charm to upgrade, in order (repeatable). Replaces the configured list.
    #[arg(short, long = "apps", value_name = "CHARM")]
    pub apps: Vec<String>,
    /// Target origin. An empty value leaves origins untouched.
    #[arg(short, long, default_value = DEFAULT_ORIGIN)]
    pub origin: String,
    /// Application to origin config key, e.g. `ceph-osd=source,glance=openstack-origin`.
    #[arg(long, value_parser = parse_key_values)]
    pub origin_keys: Option<BTreeMap<String, String>>,
    /// Keep going when a charm or unit fails.
    #[arg(short, long)]
    pub ignore_errors: bool,
    /// Pause each unit (and its HA subordinate) around its upgrade.
    #[arg(short, long)]
    pub pause: bool,
    /// Stop before upgrading compute units that would need evacuation.
    #[arg(short, long)]
    pub evacuate: bool,
    /// Skip charm revision upgrades.
    #[arg(long, conflicts_with = "charms_only")]
    pub upgrade_only: bool,
    /// Only upgrade charm revisions.
    #[arg(long)]
    pub charms_only: bool,
    /// Log what would change without changing it.
    #[arg(long)]
    pub dry_run: bool,
    /// Action run on each unit instead of `openstack-upgrade`.
    #[arg(long)]
    pub upgrade_action: Option<String>,
    /// Parameters for the upgrade action, e.g. `a=1,b=2`.
    #[arg(long, value_parser = parse_key_values)]
    pub upgrade_params: Option<BTreeMap<String, String>>,
    /// Settings file (YAML or TOML) with `services`, `add_services`, `origin_keys`.
    #[arg(short, long)]
    pub settings: Option<PathBuf>,
    /// Report format printed on success: text or json.
    #[arg(long, default_value = "text")]
    pub format: String,
}

impl UpgradeArgs {
    pub fn options(&self) -> UpgradeOptions {
        UpgradeOptions {
            apps: self.apps.clone(),
            origin: self.origin.clone(),
            origin_keys: self.origin_keys.clone().unwrap_or_default(),
            dry_run: self.dry_run,
            ignore_errors: self.ignore_errors,
            pause: self.pause,
            evacuate: self.evacuate,
            charms_only: self.charms_only,
            upgrade_only: self.upgrade_only,
            upgrade_action: UpgradeAction::from_name(self.upgrade_action.as_deref()),
            upgrade_params: self.upgrade_params.clone().unwrap_or_default(),
        }
    }

    pub fn plan(&self) -> UpgradePlan {
        let settings = UpgradeSettings::load_or_default(self.settings.as_deref());
        UpgradePlan::build(settings, self.options())
    }
}

pub async fn execute(args: UpgradeArgs) -> anyhow::Result<()> {
    let plan = args.plan();
    let (client, deadline) = args.connect.open().await?;
    let report = super::bounded(&client, deadline, run(&client, plan)).await?;
    print_report(&report, &args.format)
}

/// Run the whole upgrade against `client`.
pub async fn run<C>(client: &C, plan: UpgradePlan) -> anyhow::Result<UpgradeReport>
where
    C: ClusterClient + ?Sized,
{
    if plan.options.dry_run {
        info!("dry run: no changes will be made");
    }
    let report = match Orchestrator::new(client, plan).run().await {
        Ok(report) => report,
        Err(e) if e.is_connection_lost() => {
            error!(error = %e, "lost the connection to the controller");
            return Err(anyhow::Error::new(e).context("connection to the controller lost"));
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        upgraded = %report.revisions.upgraded.join(", "),
        latest = %report.revisions.latest.join(", "),
        "charm revisions"
    );
    for app in &report.applications {
        info!(
            app = %app.application,
            strategy = ?app.strategy,
            before = app.version_before.as_deref().unwrap_or("-"),
            after = app.version_after.as_deref().unwrap_or("-"),
            "upgraded"
        );
    }
    Ok(report)
}

fn print_report(report: &UpgradeReport, format: &str) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(report)?),
        _ => {
            println!("✓ Upgrade finished");
            if !report.revisions.upgraded.is_empty() {
                println!("  Charms upgraded: {}", report.revisions.upgraded.join(", "));
            }
            for app in &report.applications {
                println!(
                    "  {:<24} {:<8} {} → {}",
                    app.application,
                    format!("{:?}", app.strategy).to_lowercase(),
                    app.version_before.as_deref().unwrap_or("-"),
                    app.version_after.as_deref().unwrap_or("-"),
                );
            }
            let status: Vec<String> = report
                .status
                .iter()
                .map(|(status, count)| format!("{}={count}", status.as_str()))
                .collect();
            println!("  Status: {}", status.join(" "));
        }
    }
    Ok(())
}
