//! Peer announcements.
//!
//! A peer is a service binding published into the DHT: the peer keypair's
//! public key is the peer id, `node_id` names the node hosting the service,
//! `origin` the node that made the announcement (different when delegated),
//! and the signature covers the binding so nobody can re-announce a peer
//! somewhere else.

use std::fmt;

use lib_crypto::signature;

use crate::error::{Error, Result};
use crate::id::Id;

#[derive(Clone)]
pub struct PeerInfo {
    public_key: Id,
    private_key: Option<signature::PrivateKey>,
    node_id: Id,
    origin: Id,
    port: u16,
    alternative_url: Option<String>,
    signature: Vec<u8>,
}

impl PeerInfo {
    /// Announce a service on `node_id`:`port` under a fresh peer keypair.
    pub fn create(node_id: &Id, port: u16) -> Result<PeerInfo> {
        Self::create_with(&signature::KeyPair::random(), node_id, node_id, port, None)
    }

    pub fn create_with(
        keypair: &signature::KeyPair,
        node_id: &Id,
        origin: &Id,
        port: u16,
        alternative_url: Option<&str>,
    ) -> Result<PeerInfo> {
        if port == 0 {
            return Err(Error::Value("peer port must be non-zero".into()));
        }
        let mut peer = PeerInfo {
            public_key: Id::from(keypair.public_key()),
            private_key: Some(keypair.private_key().clone()),
            node_id: *node_id,
            origin: *origin,
            port,
            alternative_url: alternative_url.map(str::to_owned),
            signature: Vec::new(),
        };
        peer.signature = keypair.sign(&peer.sign_data()).to_vec();
        Ok(peer)
    }

    /// Reassemble a peer received from the wire; `origin` defaults to the
    /// hosting node when the announcement was not delegated.
    pub fn of(
        public_key: Id,
        node_id: Id,
        origin: Option<Id>,
        port: u16,
        alternative_url: Option<String>,
        signature: Vec<u8>,
    ) -> PeerInfo {
        PeerInfo {
            public_key,
            private_key: None,
            origin: origin.unwrap_or(node_id),
            node_id,
            port,
            alternative_url,
            signature,
        }
    }

    pub fn id(&self) -> &Id {
        &self.public_key
    }

    pub fn node_id(&self) -> &Id {
        &self.node_id
    }

    pub fn origin(&self) -> &Id {
        &self.origin
    }

    pub fn is_delegated(&self) -> bool {
        self.node_id != self.origin
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn alternative_url(&self) -> Option<&str> {
        self.alternative_url.as_deref()
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    fn sign_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(70 + self.alternative_url.as_ref().map_or(0, |u| u.len()));
        buf.extend_from_slice(self.node_id.as_bytes());
        buf.extend_from_slice(self.origin.as_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());
        if let Some(url) = &self.alternative_url {
            buf.extend_from_slice(url.as_bytes());
        }
        buf
    }

    pub fn is_valid(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        let Ok(pk) = self.public_key.to_signature_key() else {
            return false;
        };
        pk.verify(&self.sign_data(), &self.signature).is_ok()
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
            && self.node_id == other.node_id
            && self.origin == other.origin
            && self.port == other.port
            && self.alternative_url == other.alternative_url
            && self.signature == other.signature
    }
}

impl Eq for PeerInfo {}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PeerInfo({}@{}:{})",
            self.public_key, self.node_id, self.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_peer_verifies() {
        let node_id = Id::random();
        let peer = PeerInfo::create(&node_id, 8080).unwrap();
        assert!(peer.is_valid());
        assert!(!peer.is_delegated());
        assert_eq!(peer.node_id(), &node_id);
    }

    #[test]
    fn delegated_peer_keeps_origin() {
        let keypair = signature::KeyPair::random();
        let node_id = Id::random();
        let origin = Id::random();
        let peer =
            PeerInfo::create_with(&keypair, &node_id, &origin, 9000, Some("https://alt.example"))
                .unwrap();
        assert!(peer.is_valid());
        assert!(peer.is_delegated());
    }

    #[test]
    fn port_tamper_breaks_signature() {
        let node_id = Id::random();
        let peer = PeerInfo::create(&node_id, 8080).unwrap();
        let forged = PeerInfo::of(
            *peer.id(),
            *peer.node_id(),
            None,
            8081,
            None,
            peer.signature().to_vec(),
        );
        assert!(!forged.is_valid());
    }

    #[test]
    fn zero_port_rejected() {
        assert!(PeerInfo::create(&Id::random(), 0).is_err());
    }
}
