use clap::Parser;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use camlink_common::helpers::env_bool;
use camlink_gateway::AppState;

#[derive(Parser, Debug)]
#[command(name = "camlink-gateway")]
#[command(about = "Signaling relay for camlink cameras and viewers")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CAMLINK_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

fn check_public_bind_allowed(addr: SocketAddr) -> anyhow::Result<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if env_bool("CAMLINK_ALLOW_PUBLIC_BIND", false) {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "refusing non-loopback bind without CAMLINK_ALLOW_PUBLIC_BIND=1"
    ))
}

fn ws_signaling_url_for_bound_addr(bound_addr: SocketAddr) -> String {
    let host = if bound_addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bound_addr.ip().to_string()
    };
    format!("ws://{}:{}/ws", host, bound_addr.port())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    camlink_common::init_tracing_with_default("camlink_gateway=info,info");
    let args = Args::parse();
    check_public_bind_allowed(args.bind)?;

    let listener = match TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            let fallback_addr = SocketAddr::new(args.bind.ip(), 0);
            tracing::warn!(
                "gateway bind {} is already in use, falling back to {}",
                args.bind,
                fallback_addr
            );
            TcpListener::bind(fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };
    let bound_addr = listener.local_addr()?;
    tracing::info!("gateway listening on {}", bound_addr);
    tracing::info!(
        "gateway signaling url {}",
        ws_signaling_url_for_bound_addr(bound_addr)
    );

    tokio::select! {
        served = camlink_gateway::serve(listener, AppState::default()) => served?,
        _ = tokio::signal::ctrl_c() => tracing::info!("gateway shutting down"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_url_for_unspecified_bind() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        assert_eq!(ws_signaling_url_for_bound_addr(addr), "ws://127.0.0.1:9000/ws");
    }

    #[test]
    fn test_loopback_bind_always_allowed() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert!(check_public_bind_allowed(addr).is_ok());
    }
}
