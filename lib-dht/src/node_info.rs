//! Node address records.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::id::Id;

/// IP family a socket or DHT instance belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Family {
        if addr.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A known node: id, UDP address, optionally the version it advertised.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    id: Id,
    addr: SocketAddr,
    version: u32,
}

impl NodeInfo {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        NodeInfo { id, addr, version: 0 }
    }

    pub fn with_version(id: Id, addr: SocketAddr, version: u32) -> Self {
        NodeInfo { id, addr, version }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeInfo({}@{})", self.id, self.addr)
    }
}

/// Source-address sanity check applied before anything reaches the routing
/// table. Plain builds reject bogons; `devnet` builds accept loopback and
/// private ranges so LAN rigs and loopback tests work.
pub fn is_acceptable_source(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }

    #[cfg(feature = "devnet")]
    {
        !addr.ip().is_unspecified() && !addr.ip().is_multicast()
    }

    #[cfg(not(feature = "devnet"))]
    {
        match addr.ip() {
            IpAddr::V4(ip) => {
                !ip.is_unspecified()
                    && !ip.is_loopback()
                    && !ip.is_private()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_multicast()
                    && !ip.is_documentation()
            }
            IpAddr::V6(ip) => {
                !ip.is_unspecified() && !ip.is_loopback() && !ip.is_multicast()
            }
        }
    }
}
