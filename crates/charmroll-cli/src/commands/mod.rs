pub mod clean;
pub mod deploy;
pub mod upgrade;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tokio::time::Instant;
use tracing::{info, warn};

use charmroll_client::{ClusterClient, ConnectOptions, JujuCli};

/// The overall `--timeout` expired before the command finished.
#[derive(Debug, thiserror::Error)]
#[error("command did not finish within {}s", .0.as_secs())]
pub struct DeadlineExpired(pub Duration);

/// The overall `--timeout` budget. The clock starts when it is created,
/// before the connection is opened.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    limit: Duration,
    at: Instant,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            limit,
            at: Instant::now() + limit,
        }
    }
}

/// Controller connection and overall deadline, shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectArgs {
    /// Controller name (local client configuration).
    #[arg(short, long)]
    pub controller: Option<String>,
    /// Model name, or model UUID together with --endpoint.
    #[arg(short, long)]
    pub model: Option<String>,
    /// Controller API endpoint (host:port), bypassing local configuration.
    #[arg(long)]
    pub endpoint: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
    /// Path to the controller CA certificate (PEM).
    #[arg(long)]
    pub cacert: Option<PathBuf>,
    /// Give up after this many seconds, connecting included (exit code 124).
    #[arg(short, long)]
    pub timeout: Option<u64>,
    /// `juju` executable to drive.
    #[arg(long, value_name = "PATH")]
    pub juju_binary: Option<PathBuf>,
    /// `charm` executable used for catalog lookups.
    #[arg(long, value_name = "PATH")]
    pub charm_binary: Option<PathBuf>,
}

impl ConnectArgs {
    /// Start the overall deadline clock, if one was requested.
    pub fn deadline(&self) -> Option<Deadline> {
        self.timeout.map(|secs| Deadline::after(Duration::from_secs(secs)))
    }

    pub async fn options(&self) -> anyhow::Result<ConnectOptions> {
        let cacert = match &self.cacert {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading CA certificate {}", path.display()))?,
            ),
            None => None,
        };
        Ok(ConnectOptions {
            controller: self.controller.clone(),
            model: self.model.clone(),
            endpoint: self.endpoint.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            cacert,
            juju_binary: self.juju_binary.clone(),
            charm_binary: self.charm_binary.clone(),
        })
    }

    pub async fn connect(&self) -> anyhow::Result<JujuCli> {
        let options = self.options().await?;
        let client = JujuCli::connect(&options)
            .await
            .context("connecting to the model")?;
        info!(
            model = options.model.as_deref().unwrap_or("current"),
            remote = options.is_remote(),
            "connected"
        );
        Ok(client)
    }

    /// Start the deadline and connect within it.
    pub async fn open(&self) -> anyhow::Result<(JujuCli, Option<Deadline>)> {
        let deadline = self.deadline();
        let client = within(deadline, self.connect()).await?;
        Ok((client, deadline))
    }
}

/// Drive `work` to completion unless `deadline` passes first.
pub async fn within<T>(
    deadline: Option<Deadline>,
    work: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline.at, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeadlineExpired(deadline.limit).into()),
        },
        None => work.await,
    }
}

/// Drive `work` to completion under the optional deadline, then release
/// the connection whatever the outcome.
pub async fn bounded<C, T>(
    client: &C,
    deadline: Option<Deadline>,
    work: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T>
where
    C: ClusterClient + ?Sized,
{
    let outcome = within(deadline, work).await;

    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "failed to disconnect");
    }
    outcome
}
