// hamon-daemon/src/main.rs
// hamond entry point: load configuration, activate the HA stack, serve the
// control socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hamon_core::HaMaster;
use hamon_daemon::ControlServer;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "hamond", about = "HA master daemon")]
struct Args {
    /// Configuration file (TOML). HAMON_* environment variables override
    /// file values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured node list (group@host,host...)
    #[arg(long)]
    node_list: Option<String>,

    /// Override the configured UDP heartbeat port
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured control socket path
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = hamon_config::load_config(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(node_list) = args.node_list {
        config.node_list = node_list;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = args.control_socket {
        config.control_socket = path.to_string_lossy().into_owned();
    }
    hamon_config::validate_config(&config).context("invalid configuration")?;

    if args.check_config {
        println!("configuration ok");
        return Ok(());
    }

    // the reload admin command re-reads the same file
    if let Some(path) = &args.config {
        std::env::set_var("HAMON_CONFIG", path);
    }

    info!(
        node_list = %config.node_list,
        port = config.port,
        socket = %config.control_socket,
        "starting hamond"
    );

    let socket_path = config.control_socket.clone();
    let master = Arc::new(HaMaster::new(config).context("failed to set up the HA context")?);
    master.activate().context("failed to activate HA")?;

    let server = Arc::new(ControlServer::new(master, socket_path));
    server.run().context("control socket server failed")?;

    Ok(())
}
