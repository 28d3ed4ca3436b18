use crate::config::{ClusterBackend, Config, ProxmoxConfig};
use crate::features::cluster::repo::proxmox::ProxmoxClusterRepository;
use crate::features::cluster::repo::{ClusterRepository, InMemoryClusterRepository};
use crate::logging;
use crate::server::{self, AppState};
use anyhow::Context;
use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "rc3",
    about = "Provision and manage containers on a Proxmox cluster",
    version = concat!("v", env!("CARGO_PKG_VERSION"))
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage the rc3 REST API service
    #[command(subcommand)]
    Service(ServiceCommands),
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommands {
    /// Start the rc3 REST API service
    Start(StartArgs),
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Path to a TOML config file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Parse the process arguments; `--help` lists every config env var.
    pub fn parse_args() -> Self {
        let help = env_var_help();
        let command = Cli::command()
            .after_long_help(help.clone())
            .mut_subcommand("service", |service| {
                service.mut_subcommand("start", |start| start.after_help(help))
            });

        let matches = command.get_matches();
        Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }
}

fn env_var_help() -> String {
    let mut help = String::from("Environment variables:\n");
    for var in Config::env_vars() {
        help.push_str("  ");
        help.push_str(&var);
        help.push('\n');
    }
    help
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Service(ServiceCommands::Start(args)) => start_service(args).await,
    }
}

async fn start_service(args: StartArgs) -> anyhow::Result<()> {
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.general, &config.development);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rc3");

    let cluster = build_cluster(&config.proxmox)?;
    let cluster_version = cluster
        .version()
        .await
        .context("could not reach the cluster")?;
    info!(
        %cluster_version,
        backend = ?config.proxmox.backend,
        "Connected to cluster"
    );

    if config.development.bypass_auth {
        warn!(
            dev_identity = %config.development.dev_identity,
            "Auth bypass enabled; requests without an identity act as the dev identity"
        );
    }

    let state = Arc::new(AppState::new(cluster, &config)?);
    server::serve(
        &config.server.host,
        state,
        Duration::from_secs(config.server.shutdown_timeout_secs),
    )
    .await
}

fn build_cluster(config: &ProxmoxConfig) -> anyhow::Result<Arc<dyn ClusterRepository>> {
    match config.backend {
        ClusterBackend::Proxmox => Ok(Arc::new(
            ProxmoxClusterRepository::new(config).context("failed to build cluster client")?,
        )),
        ClusterBackend::InMemory => {
            warn!("Using the in-memory cluster; nothing is provisioned");
            Ok(Arc::new(InMemoryClusterRepository::with_nodes(["local"])))
        }
    }
}
