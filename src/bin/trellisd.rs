use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use trellis::config::NetConf;
use trellis::delegate::{CniExecDelegate, VlanDelegate};
use trellis::device::NetlinkResolver;
use trellis::firewall::RuleSync;
use trellis::portmap::{MappingStore, PortmapPlugin};
use trellis::server::{self, Dispatcher};
use trellis::topology::TopologyManager;

/// Node-local network provisioning agent
#[derive(Parser)]
#[command(name = "trellisd", author, version, about)]
struct Args {
    /// Path to the network configuration file
    #[arg(long, default_value = "/etc/trellis/netconf.json")]
    network_conf: PathBuf,

    /// Unix socket the agent listens on
    #[arg(long, default_value = "/run/trellis.sock")]
    socket: PathBuf,

    /// Directory holding per-container port mapping records
    #[arg(long, default_value = "/var/lib/trellis/portmappings")]
    state_dir: PathBuf,

    /// Directory holding CNI plugin binaries
    #[arg(long, default_value = "/opt/cni/bin")]
    cni_bin_dir: PathBuf,

    /// Name of the port mapping plugin binary
    #[arg(long, default_value = "portmap")]
    portmap_plugin: String,

    /// Persisted firewall ruleset replayed on an interval
    #[arg(long, default_value = "/etc/trellis/rules.v4")]
    ruleset_file: PathBuf,

    /// Program the ruleset is piped to
    #[arg(long, default_value = "/sbin/iptables-restore")]
    restore_program: PathBuf,

    /// Seconds between ruleset replays
    #[arg(long, default_value_t = 300)]
    sync_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("agent error: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = NetConf::load(&args.network_conf)?;
    info!(
        device = %config.device,
        switch = ?config.switch,
        "loaded network configuration"
    );

    let resolver = Arc::new(NetlinkResolver::new()?);
    let topology = Arc::new(TopologyManager::new(config, resolver));
    topology
        .init()
        .await
        .context("topology initialization failed")?;

    let delegate = Arc::new(VlanDelegate::new(
        Arc::clone(&topology),
        CniExecDelegate::new(&args.cni_bin_dir),
    ));
    let mapper = Arc::new(PortmapPlugin::new(
        &args.cni_bin_dir,
        args.portmap_plugin.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        delegate,
        MappingStore::new(&args.state_dir),
        mapper,
    ));

    RuleSync::new(
        &args.restore_program,
        &args.ruleset_file,
        Duration::from_secs(args.sync_interval_secs),
    )
    .spawn();

    server::serve(&args.socket, dispatcher).await
}
