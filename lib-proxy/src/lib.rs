//! Meridian active proxy.
//!
//! Lets a TCP service behind NAT be reached through a rendezvous server
//! addressed via the DHT. The worker keeps a pool of outbound TCP
//! connections to the rendezvous; each connection authenticates with the
//! node identity, agrees on a session key, and relays one upstream flow at
//! a time behind type-disguised framing.

pub mod connection;
pub mod error;
pub mod packet;
pub mod worker;

pub use connection::{ConnectionState, FrameBuffer};
pub use error::{Error, Result};
pub use packet::PacketType;
pub use worker::{ActiveProxy, NodeIdentity, ProxyConfig, Timing};
