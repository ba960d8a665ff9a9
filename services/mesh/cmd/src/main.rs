//! Overlay network node binary.
//!
//! Starts one node with the TCP transport, connects it to the configured peers, and serves
//! the admin console on stdin until `quit`, end of input, or a termination signal.

use clap::Parser;
use mesh_channel::transport::TcpTransportProvider;
use mesh_routing::OverlayNode;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};

mod config;
mod control;
mod logging;

use config::MeshConfig;
use control::AdminConsole;

/// Overlay network node with link-state routing
#[derive(Parser, Debug)]
#[command(name = "flow-mesh", version, about = "Overlay network node with link-state routing")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "flow-mesh.yaml")]
    config: PathBuf,

    /// Node id (overrides the configuration)
    #[arg(long)]
    node_id: Option<String>,

    /// Display name (overrides the configuration)
    #[arg(long)]
    display_name: Option<String>,

    /// Forward requests on behalf of other nodes
    #[arg(long)]
    relay: bool,

    /// Contact point to listen at, e.g. tcp:0.0.0.0:21000 (repeatable, replaces the configured list)
    #[arg(long)]
    listen: Vec<String>,

    /// Contact point to connect to on startup (repeatable, added to the configured list)
    #[arg(long)]
    connect: Vec<String>,

    /// Round-trip timeout of a request, e.g. 40s
    #[arg(long)]
    request_timeout: Option<humantime::Duration>,

    /// Timeout of a forwarded request, e.g. 35s
    #[arg(long)]
    forwarding_timeout: Option<humantime::Duration>,

    /// Period of the health-check loop, e.g. 20s
    #[arg(long)]
    health_check_interval: Option<humantime::Duration>,

    /// Disable the periodic health checks
    #[arg(long)]
    no_health_checks: bool,

    /// Accept inbound connections only from this address (repeatable, enables the filter)
    #[arg(long)]
    allow_ip: Vec<IpAddr>,

    /// Do not read admin commands from stdin
    #[arg(long)]
    no_console: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags override file and environment values
    fn apply_to(&self, config: &mut MeshConfig) {
        if let Some(node_id) = &self.node_id {
            config.node.node_id = Some(node_id.clone());
        }
        if let Some(display_name) = &self.display_name {
            config.node.display_name = Some(display_name.clone());
        }
        if self.relay {
            config.node.relay = true;
        }
        if !self.listen.is_empty() {
            config.network.listen = self.listen.clone();
        }
        config.network.connect.extend(self.connect.iter().cloned());
        if let Some(timeout) = self.request_timeout {
            config.communication.request_timeout = timeout.into();
        }
        if let Some(timeout) = self.forwarding_timeout {
            config.communication.forwarding_timeout = timeout.into();
        }
        if let Some(interval) = self.health_check_interval {
            config.communication.health_check_interval = interval.into();
        }
        if self.no_health_checks {
            config.network.health_checks = false;
        }
        if !self.allow_ip.is_empty() {
            config.filter.enabled = true;
            config.filter.allowed_ips = self.allow_ip.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("flow-mesh", &args.log_level)?;

    info!("Starting flow-mesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = MeshConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    let node_info = config.node_info()?;
    let settings = config.node_settings()?;

    info!(
        "Node {} (relay: {}), request timeout {:?}, forwarding timeout {:?}",
        node_info.log_description(),
        node_info.is_relay,
        config.communication.request_timeout,
        config.communication.forwarding_timeout
    );

    let node = OverlayNode::new(node_info, config.communication.clone()).await;
    node.add_transport_provider(Arc::new(TcpTransportProvider::new()))?;
    let bound = node.start(&settings).await?;
    for contact_point in &bound {
        info!("Accepting connections at {}", contact_point);
    }

    let console = AdminConsole::new(node.clone(), settings.allow_duplex);
    run_until_stopped(console, args.no_console).await;

    node.shutdown().await;
    // let the shutdown notice and close frames leave the sockets
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Node stopped");
    Ok(())
}

/// Serve the console until it ends or a termination signal arrives
async fn run_until_stopped(console: AdminConsole, no_console: bool) {
    let console_task = async {
        if no_console {
            std::future::pending::<()>().await;
        }
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = console.run(stdin, tokio::io::stdout()).await {
            crate::component_error!("console", "Admin console failed: {}", e);
        }
        info!("Admin console closed");
    };

    tokio::select! {
        _ = console_task => {}
        _ = shutdown_signal() => {
            info!("Received termination signal, initiating graceful shutdown");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "flow-mesh",
            "--node-id",
            "cli-node",
            "--relay",
            "--listen",
            "tcp:127.0.0.1:22000",
            "--connect",
            "tcp:127.0.0.1:22001",
            "--request-timeout",
            "5s",
            "--forwarding-timeout",
            "4s",
            "--allow-ip",
            "127.0.0.1",
            "--no-health-checks",
        ]);

        let mut config = MeshConfig::default();
        config.network.connect = vec!["tcp:10.0.0.9:21000".to_string()];
        args.apply_to(&mut config);

        assert_eq!(config.node.node_id.as_deref(), Some("cli-node"));
        assert!(config.node.relay);
        assert_eq!(config.network.listen, vec!["tcp:127.0.0.1:22000"]);
        assert_eq!(config.network.connect.len(), 2);
        assert_eq!(config.communication.request_timeout, Duration::from_secs(5));
        assert!(config.filter.enabled);
        assert!(!config.network.health_checks);

        let settings = config.node_settings().unwrap();
        assert_eq!(settings.allowed_ips.unwrap().len(), 1);
    }

    #[test]
    fn test_defaults_leave_config_alone() {
        let args = Args::parse_from(["flow-mesh"]);
        let mut config = MeshConfig::default();
        args.apply_to(&mut config);
        assert_eq!(config, MeshConfig::default());
    }
}
