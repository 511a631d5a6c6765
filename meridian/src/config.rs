//! Daemon configuration file model.
//!
//! ```toml
//! [node]
//! ipv4 = "0.0.0.0"
//! port = 39001
//! data_dir = "/var/lib/meridian"
//!
//! [logging]
//! filter = "info,lib_dht=debug"
//!
//! [[bootstrap]]
//! node = "HZXXs9LTfNQjrDKvvexRhuMk8TTJhYCfrHwaj3jUzuhZ@155.138.245.211:39001"
//!
//! [activeproxy]
//! server_peer_id = "FemkhMoop6mhCi6LRkY9XBEYK9hDn58hWq3fWrGBtPnf"
//! upstream_host = "127.0.0.1"
//! upstream_port = 8080
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub bootstrap: Vec<BootstrapEntry>,
    pub activeproxy: Option<ActiveProxySection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSection {
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    #[serde(default)]
    pub port: u16,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapEntry {
    /// `<base58 id>@<address>:<port>`
    pub node: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActiveProxySection {
    /// Locate the rendezvous through the DHT...
    pub server_peer_id: Option<String>,
    /// ...or address it directly.
    pub server_id: Option<String>,
    pub server_host: Option<IpAddr>,
    pub server_port: Option<u16>,

    pub upstream_host: IpAddr,
    pub upstream_port: u16,

    pub domain_name: Option<String>,
    /// Hex seed of the keypair publishing the relayed service.
    pub peer_private_key: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    8
}

pub fn load(path: &std::path::Path) -> Result<DaemonConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("cannot parse config file {}", path.display()))
}

/// Parse a `<id>@<addr>:<port>` bootstrap descriptor.
pub fn parse_bootstrap(descriptor: &str) -> Result<lib_dht::NodeInfo> {
    let (id, addr) = descriptor
        .split_once('@')
        .context("bootstrap node must look like <id>@<address>:<port>")?;
    let id: lib_dht::Id = id
        .parse()
        .with_context(|| format!("invalid bootstrap node id '{}'", id))?;
    let addr = addr
        .parse()
        .with_context(|| format!("invalid bootstrap address '{}'", addr))?;
    Ok(lib_dht::NodeInfo::new(id, addr))
}
