use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use kubedock_cli::{logging, Runtime};
use kubedock_config::Config;
use std::process;

mod cli;

#[derive(Parser)]
#[command(name = "kubedock")]
#[command(about = "kubedock - run Docker API workloads as Kubernetes pods")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the entity store and seed the default network
    Init,
    /// List containers
    Ps {
        /// Ask the cluster for each container's live status
        #[arg(long)]
        live: bool,
    },
    /// List networks and their members
    Networks,
    /// Print the logs of a container's pod
    Logs {
        /// Container id, id prefix or name
        id: String,
        /// Keep streaming until interrupted or the pod exits
        #[arg(short, long)]
        follow: bool,
        /// Only show the last N lines
        #[arg(long)]
        tail: Option<u32>,
    },
    /// Remove a container and its pod
    Rm {
        /// Container id, id prefix or name
        id: String,
    },
    /// Remove managed pods that no container record owns
    Prune {
        /// Report orphaned pods without removing them
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;
    logging::init(&config)?;
    let runtime = Runtime::open(config).await?;

    match command {
        Commands::Init => cli::containers::init(&runtime).await,
        Commands::Ps { live } => cli::containers::ps(&runtime, live).await,
        Commands::Networks => cli::networks::list(&runtime).await,
        Commands::Logs { id, follow, tail } => {
            cli::containers::logs(&runtime, &id, follow, tail).await
        }
        Commands::Rm { id } => cli::containers::rm(&runtime, &id).await,
        Commands::Prune { dry_run } => cli::containers::prune(&runtime, dry_run).await,
    }
}
