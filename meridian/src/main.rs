//! The Meridian daemon: a DHT node, optionally fronting a NAT-bound
//! service through the active proxy.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use lib_dht::node::Node;
use lib_dht::NodeConfig;
use lib_proxy::{ActiveProxy, ProxyConfig};

use config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "meridian", about = "Meridian overlay network daemon", version)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IPv4 address to listen on
    #[arg(long, value_name = "ADDR")]
    ipv4: Option<std::net::IpAddr>,

    /// IPv6 address to listen on
    #[arg(long, value_name = "ADDR")]
    ipv6: Option<std::net::IpAddr>,

    /// UDP port for the DHT
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for the identity key and caches
    #[arg(short = 'd', long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Bootstrap node, as <id>@<address>:<port>; repeatable
    #[arg(short, long, value_name = "NODE")]
    bootstrap: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => config::load(path)?,
        None => DaemonConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&file_config.logging.filter)
                .context("invalid logging filter")?,
        )
        .init();

    // CLI flags override the config file
    let addr4 = args.ipv4.or(file_config.node.ipv4);
    let addr6 = args.ipv6.or(file_config.node.ipv6);
    let port = args.port.unwrap_or(file_config.node.port);
    let data_dir = args.data_dir.or(file_config.node.data_dir);

    if addr4.is_none() && addr6.is_none() {
        bail!("no listen address: pass --ipv4/--ipv6 or set them in the config file");
    }

    let mut node_config = NodeConfig::new();
    node_config.addr4 = addr4;
    node_config.addr6 = addr6;
    node_config.port = port;
    node_config.data_dir = data_dir;
    for descriptor in &args.bootstrap {
        node_config.bootstrap.push(config::parse_bootstrap(descriptor)?);
    }
    for entry in &file_config.bootstrap {
        node_config.bootstrap.push(config::parse_bootstrap(&entry.node)?);
    }

    let node = Arc::new(
        Node::start(node_config)
            .await
            .context("failed to start the DHT node")?,
    );
    info!(id = %node.id(), "node is running");

    let proxy = match &file_config.activeproxy {
        Some(section) => Some(start_proxy(node.clone(), section).await?),
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutting down");

    if let Some(proxy) = proxy {
        proxy.stop().await;
    }
    node.stop().await?;
    Ok(())
}

async fn start_proxy(
    node: Arc<Node>,
    section: &config::ActiveProxySection,
) -> Result<ActiveProxy> {
    let upstream_addr = std::net::SocketAddr::new(section.upstream_host, section.upstream_port);

    let (server_id, server_addr) = if let Some(peer_id) = &section.server_peer_id {
        let peer_id: lib_dht::Id = peer_id.parse().context("invalid server peer id")?;
        ActiveProxy::locate_service(&node, &peer_id)
            .await
            .context("cannot locate the rendezvous service through the DHT")?
    } else {
        let id = section
            .server_id
            .as_deref()
            .context("activeproxy needs server_peer_id, or server_id with address")?
            .parse()
            .context("invalid server id")?;
        let host = section
            .server_host
            .context("activeproxy.server_host is required with server_id")?;
        let port = section
            .server_port
            .context("activeproxy.server_port is required with server_id")?;
        (id, std::net::SocketAddr::new(host, port))
    };

    let mut proxy_config = ProxyConfig::new(server_id, server_addr, upstream_addr);
    proxy_config.domain_name = section.domain_name.clone();
    proxy_config.max_connections = section.max_connections;
    if let Some(seed_hex) = &section.peer_private_key {
        let raw = hex::decode(seed_hex).context("invalid peer_private_key hex")?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .ok()
            .context("peer_private_key must be a 32-byte seed")?;
        proxy_config.peer_keypair = Some(lib_crypto::signature::KeyPair::from_seed(&seed));
    } else {
        warn!("activeproxy has no peer_private_key; the service will not be announced");
    }

    info!(server = %server_addr, upstream = %upstream_addr, "starting the active proxy");
    Ok(ActiveProxy::start(node.clone(), Some(node), proxy_config))
}
