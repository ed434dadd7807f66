//! slotd — the SlotGrid daemon.
//!
//! Runs a fleet of placement agents against a shared in-memory store, and
//! optionally drives it with the load generator.
//!
//! # Usage
//!
//! ```text
//! slotd run --nodes 3 --heartbeat-interval 10s
//! slotd spam --app my-app --instances 100
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use slotd::{Fleet, FleetConfig, LocalBus, SlotdConfig, SpamConfig};
use slotgrid_store::{CoordinationStore, MemoryStore};

#[derive(Parser)]
#[command(name = "slotd", about = "SlotGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fleet until Ctrl-C.
    Run {
        #[command(flatten)]
        fleet: FleetArgs,
    },
    /// Run a fleet, start every instance of one app, and report how long it took.
    Spam {
        #[command(flatten)]
        fleet: FleetArgs,

        /// App identifier (default: random UUID).
        #[arg(long)]
        app: Option<String>,

        /// Instances to start.
        #[arg(long, default_value = "100")]
        instances: u32,

        /// Give up after this long, e.g. "2m".
        #[arg(long)]
        deadline: Option<String>,
    },
}

#[derive(Args)]
struct FleetArgs {
    /// Number of nodes in the fleet.
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Path to slotd.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Heartbeat interval, e.g. "10s". Overrides the config file.
    #[arg(long)]
    heartbeat_interval: Option<String>,

    /// Probability in [0, 1] that a claimed instance is killed later.
    #[arg(long)]
    chaos: Option<f64>,
}

impl FleetArgs {
    fn load(&self) -> anyhow::Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => SlotdConfig::from_file(path)?,
            None => SlotdConfig::default(),
        };
        if let Some(interval) = &self.heartbeat_interval {
            config.node.heartbeat_interval = Some(interval.clone());
        }
        if let Some(probability) = self.chaos {
            config.chaos.probability = Some(probability);
        }
        FleetConfig::from_config(&config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,slotd=debug,slotgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { fleet } => run(fleet).await,
        Command::Spam {
            fleet,
            app,
            instances,
            deadline,
        } => run_spam(fleet, app, instances, deadline).await,
    }
}

async fn launch(args: &FleetArgs) -> anyhow::Result<(Fleet, FleetConfig)> {
    let config = args.load()?;
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let fleet = Fleet::launch(args.nodes, store, LocalBus::new(), &config).await?;
    Ok((fleet, config))
}

async fn run(args: FleetArgs) -> anyhow::Result<()> {
    info!(nodes = args.nodes, "SlotGrid daemon starting");
    let (fleet, _) = launch(&args).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    fleet.shutdown().await;
    info!("SlotGrid daemon stopped");
    Ok(())
}

async fn run_spam(
    args: FleetArgs,
    app: Option<String>,
    instances: u32,
    deadline: Option<String>,
) -> anyhow::Result<()> {
    let deadline = deadline
        .map(|d| {
            slotd::config::parse_duration(&d).with_context(|| format!("invalid deadline {d:?}"))
        })
        .transpose()?;

    let (fleet, fleet_config) = launch(&args).await?;
    let spam_config = SpamConfig {
        topic: fleet_config.topic.clone(),
        deadline,
        ..SpamConfig::new(app, instances)
    };

    let outcome = tokio::select! {
        outcome = slotd::spam(fleet.store().as_ref(), fleet.bus(), &spam_config) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(Duration::ZERO)
        }
    };

    info!(ownership = ?fleet.ownership().await?, "final slot ownership");
    fleet.shutdown().await;
    outcome.map(|_| ())
}
