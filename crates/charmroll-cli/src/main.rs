//! charmroll — rolling OpenStack charm upgrades on a Juju model.
//!
//! # Usage
//!
//! ```text
//! charmroll upgrade -m openstack --pause -o cloud:xenial-ocata
//! charmroll deploy -m openstack bundle.yaml --wait
//! charmroll clean -m openstack --force --wait
//! ```

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{DeadlineExpired, clean::CleanArgs, deploy::DeployArgs, upgrade::UpgradeArgs};

/// Exit code when the overall `--timeout` expired.
const EXIT_DEADLINE: u8 = 124;

#[derive(Parser)]
#[command(
    name = "charmroll",
    about = "Leader-aware rolling upgrades of OpenStack charms",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Debug logging for charmroll crates (ignored when RUST_LOG is set).
    #[arg(long, global = true)]
    debug: bool,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a bundle into the model.
    Deploy(DeployArgs),
    /// Upgrade charm revisions and the OpenStack release of each service.
    ///
    /// Services are handled in the configured order. Clustered services
    /// that support action-managed upgrades are upgraded one unit at a
    /// time, leader first; everything else is upgraded in bulk.
    Upgrade(UpgradeArgs),
    /// Remove applications (and optionally machines) from the model.
    Clean(CleanArgs),
}

fn init_tracing(debug: bool, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = if debug { "debug" } else { "info" };
            EnvFilter::new(format!(
                "warn,charmroll={level},charmroll_core={level},charmroll_client={level},\
                 charmroll_converge={level},charmroll_upgrade={level}"
            ))
        }
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.debug, cli.log_json) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let outcome = match cli.command {
        Commands::Deploy(args) => commands::deploy::execute(args).await,
        Commands::Upgrade(args) => commands::upgrade::execute(args).await,
        Commands::Clean(args) => commands::clean::execute(args).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<DeadlineExpired>().is_some() => {
            error!(error = %e, "deadline expired");
            ExitCode::from(EXIT_DEADLINE)
        }
        Err(e) => {
            error!(error = ?e, "charmroll failed");
            ExitCode::FAILURE
        }
    }
}
