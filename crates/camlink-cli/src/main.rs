//! camlink command line tools: run a camera or viewer endpoint, list devices.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::timeout;
use tracing::warn;

use camlink_rtc::{
    ConnectionStatus, DeviceRole, MediaConfig, Roster, RtcConnector, SignalingConfig,
    SignalingEndpoint, SignalingNode,
};

const DEVICE_LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(about = "camlink CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct EndpointArgs {
    /// Signaling server URL (ws:// or wss://)
    #[arg(short, long, env = "CAMLINK_SERVER_URL")]
    server: String,

    /// Identifier this device registers under
    #[arg(short, long, env = "CAMLINK_DEVICE_ID")]
    device_id: String,

    /// Remote device to negotiate with once registered (repeatable)
    #[arg(short, long = "connect")]
    connect: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a camera endpoint that answers viewers
    Camera(EndpointArgs),

    /// Run a viewer endpoint
    Viewer(EndpointArgs),

    /// Print the devices registered on a signaling server
    Devices {
        /// Signaling server URL (ws:// or wss://)
        #[arg(short, long, env = "CAMLINK_SERVER_URL")]
        server: String,

        /// Identifier to register under while listing
        #[arg(short, long, env = "CAMLINK_DEVICE_ID", default_value = "camlink-cli")]
        device_id: String,
    },

    /// Show version information
    Version,
}

fn start_node(server: &str, device_id: &str, role: DeviceRole) -> Result<SignalingNode> {
    let config = SignalingConfig::from_env()?;
    let connector = RtcConnector::new(MediaConfig::from_env())?;
    let node = SignalingNode::start(
        server,
        SignalingEndpoint::new(device_id, role),
        config,
        Arc::new(connector),
    )?;
    Ok(node)
}

fn print_roster(roster: &Roster) {
    if roster.is_empty() {
        println!("No other devices online");
        return;
    }
    for (id, name) in roster {
        if id == name {
            println!("  {}", id);
        } else {
            println!("  {} ({})", id, name);
        }
    }
}

async fn run_endpoint(role: DeviceRole, args: EndpointArgs) -> Result<()> {
    let node = start_node(&args.server, &args.device_id, role)?;
    println!("{} {} -> {}", role, args.device_id, args.server);

    let mut status = node.transport().subscribe();
    let mut roster = node.coordinator().roster();
    let mut pending = args.connect;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("Signaling: {:?}", current);
                if current == ConnectionStatus::Connected {
                    for device_id in pending.drain(..) {
                        if let Err(e) = node.coordinator().connect_to_device(&device_id).await {
                            warn!("could not start negotiation with {}: {}", device_id, e);
                        }
                    }
                }
            }
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("Online devices:");
                print_roster(&roster.borrow_and_update());
                for (device_id, status) in node.registry().snapshot() {
                    println!("  session {}: {:?}", device_id, status);
                }
            }
        }
    }

    node.shutdown();
    Ok(())
}

async fn list_devices(server: &str, device_id: &str) -> Result<()> {
    let node = start_node(server, device_id, DeviceRole::Viewer)?;
    let mut roster = node.coordinator().roster();

    let listed = timeout(DEVICE_LIST_TIMEOUT, roster.changed()).await;
    let result = match listed {
        Ok(Ok(())) => {
            print_roster(&roster.borrow_and_update());
            Ok(())
        }
        Ok(Err(_)) => Err(anyhow::anyhow!("signaling node stopped")),
        Err(_) => Err(anyhow::anyhow!("no device list from {}", server)),
    };

    node.shutdown();
    result.context("listing devices")
}

#[tokio::main]
async fn main() -> Result<()> {
    camlink_common::init_tracing_with_default("warn");

    let args = Args::parse();

    match args.command {
        Command::Camera(endpoint) => run_endpoint(DeviceRole::Camera, endpoint).await?,
        Command::Viewer(endpoint) => run_endpoint(DeviceRole::Viewer, endpoint).await?,
        Command::Devices { server, device_id } => list_devices(&server, &device_id).await?,
        Command::Version => {
            println!("camlink {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
