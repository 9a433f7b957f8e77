//! bitarchive-node: run one storage node on an in-process bus
//!
//! A liveness monitor consumes the monitor channel in the same process and
//! reports nodes that stopped sending heartbeats.

use anyhow::{Context, Result};
use bitarchive::admission::DiskSpaceProbe;
use bitarchive::bus::{InMemoryBus, MessageBus};
use bitarchive::config::NodeConfig;
use bitarchive::message::ChannelId;
use bitarchive::monitor::LivenessMonitor;
use bitarchive::node::BitarchiveNode;
use bitarchive::notify::LogNotifier;
use bitarchive::transfer::LocalFileTransfer;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bitarchive-node", version, about)]
struct Cli {
    /// JSON node configuration; defaults apply to missing fields
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Storage root, repeatable; replaces the configured list
    #[arg(long = "storage-dir")]
    storage_dirs: Vec<PathBuf>,

    /// Removal credentials
    #[arg(long, env = "BITARCHIVE_CREDENTIALS")]
    credentials: Option<String>,

    /// Application instance id appended to the node identity
    #[arg(long)]
    instance: Option<String>,

    /// Refuse uploads
    #[arg(long)]
    read_only: bool,

    /// Report a node dead after this many missed heartbeat intervals
    #[arg(long, default_value_t = 3)]
    missed_heartbeats: u32,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)
                .with_context(|| format!("loading config file {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if !self.storage_dirs.is_empty() {
            config.storage_dirs.clone_from(&self.storage_dirs);
        }
        if let Some(credentials) = &self.credentials {
            config.credentials.clone_from(credentials);
        }
        if self.instance.is_some() {
            config.application_instance_id.clone_from(&self.instance);
        }
        config.read_only |= self.read_only;
        config.validate().context("invalid node configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.node_config()?;
    let heartbeat_interval = config.heartbeat_interval();
    let liveness_timeout = heartbeat_interval * cli.missed_heartbeats.max(1);

    let bus = Arc::new(InMemoryBus::new());
    let monitor_channel = ChannelId::queue(&config.channels.monitor);
    let transfer = Arc::new(
        LocalFileTransfer::new(&config.staging_dir).context("preparing staging directory")?,
    );
    let node = BitarchiveNode::new(
        config,
        bus.clone(),
        Arc::new(DiskSpaceProbe),
        Arc::new(LogNotifier),
        transfer,
    )
    .context("creating bitarchive node")?;

    let stop = CancellationToken::new();
    let monitor = Arc::new(LivenessMonitor::new());
    let monitor_task = {
        let subscription = bus.subscribe(&monitor_channel)?;
        let monitor = monitor.clone();
        let stop = stop.clone();
        tokio::spawn(async move { monitor.run(subscription, stop).await })
    };
    let liveness_task = {
        let monitor = monitor.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(liveness_timeout.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        for dead in monitor.dead_nodes(liveness_timeout, chrono::Utc::now()) {
                            warn!(node = %dead, "No heartbeat within {liveness_timeout:?}");
                        }
                    }
                }
            }
        })
    };

    node.start().context("starting bitarchive node")?;
    info!(node = %node.identity(), "Serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    node.shutdown().await;
    stop.cancel();
    monitor_task.await.context("monitor task")?;
    liveness_task.await.context("liveness task")?;
    info!("Bye");
    Ok(())
}
