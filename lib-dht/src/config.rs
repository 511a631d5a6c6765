//! Node configuration.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::node_info::NodeInfo;

/// Everything a [`crate::Node`] needs to start. The daemon fills this from
/// its CLI flags and config file; tests construct it directly.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// IPv4 address to bind, if any.
    pub addr4: Option<IpAddr>,
    /// IPv6 address to bind, if any.
    pub addr6: Option<IpAddr>,
    /// UDP port, shared by both families. Zero picks an ephemeral port.
    pub port: u16,
    /// Directory for the identity key and routing table snapshots.
    /// Without one the node runs with an ephemeral identity.
    pub data_dir: Option<PathBuf>,
    /// Seed nodes contacted at startup.
    #[serde(skip)]
    pub bootstrap: Vec<NodeInfo>,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ipv4(mut self, addr: IpAddr, port: u16) -> Self {
        self.addr4 = Some(addr);
        self.port = port;
        self
    }

    pub fn with_ipv6(mut self, addr: IpAddr, port: u16) -> Self {
        self.addr6 = Some(addr);
        self.port = port;
        self
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    pub fn add_bootstrap(mut self, node: NodeInfo) -> Self {
        self.bootstrap.push(node);
        self
    }
}
