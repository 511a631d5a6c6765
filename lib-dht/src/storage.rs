//! The value/peer store behind the node.
//!
//! The core only depends on the [`DataStorage`] contract; [`MemoryStorage`]
//! is the in-process implementation the daemon and tests use. A database
//! backend implements the same trait and slots in unchanged.

use std::collections::HashMap;

use crate::constants;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::peer_info::PeerInfo;
use crate::value::Value;

/// Storage operations the DHT core relies on. All timestamps are epoch
/// milliseconds supplied by the caller, which keeps implementations
/// clock-free and testable.
pub trait DataStorage: Send {
    fn get_value(&self, value_id: &Id) -> Option<Value>;

    /// Store or replace a value.
    ///
    /// Mutable-value rules: an immutable write cannot shadow a mutable
    /// value, a caller-owned value cannot be shadowed by an unowned copy,
    /// sequence numbers never regress, and with `expected_seq >= 0` the
    /// write only lands when the stored sequence equals it. Returns the
    /// prior value when one was replaced.
    fn put_value(
        &mut self,
        value: Value,
        expected_seq: i32,
        persistent: bool,
        update_last_announce: bool,
        now: u64,
    ) -> Result<Option<Value>>;

    fn update_value_last_announce(&mut self, value_id: &Id, now: u64);

    /// Persistent values whose last announce is older than `before`.
    fn persistent_values(&self, before: u64) -> Vec<Value>;

    fn remove_value(&mut self, value_id: &Id) -> bool;

    fn value_ids(&self) -> Vec<Id>;

    fn get_peers(&self, peer_id: &Id, max_peers: usize) -> Vec<PeerInfo>;

    fn get_peer(&self, peer_id: &Id, origin: &Id) -> Option<PeerInfo>;

    fn put_peer(&mut self, peer: PeerInfo, persistent: bool, update_last_announce: bool, now: u64);

    fn update_peer_last_announce(&mut self, peer_id: &Id, origin: &Id, now: u64);

    /// Persistent peers whose last announce is older than `before`.
    fn persistent_peers(&self, before: u64) -> Vec<PeerInfo>;

    fn remove_peer(&mut self, peer_id: &Id, origin: &Id) -> bool;

    /// Drop non-persistent entries past their age limit.
    fn expire(&mut self, now: u64);
}

struct StoredValue {
    value: Value,
    persistent: bool,
    created: u64,
    last_announce: u64,
}

struct StoredPeer {
    peer: PeerInfo,
    persistent: bool,
    created: u64,
    last_announce: u64,
}

/// HashMap-backed storage with the full CAS and expiry semantics.
#[derive(Default)]
pub struct MemoryStorage {
    values: HashMap<Id, StoredValue>,
    peers: HashMap<(Id, Id), StoredPeer>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_mutable_update(existing: &Value, incoming: &Value, expected_seq: i32) -> Result<()> {
        if !existing.is_mutable() {
            return Ok(());
        }
        if !incoming.is_mutable() {
            return Err(Error::Value(
                "immutable value cannot replace a mutable value".into(),
            ));
        }
        if existing.has_private_key() && !incoming.has_private_key() {
            return Err(Error::Value("value is owned by this node".into()));
        }
        if expected_seq >= 0 && existing.sequence_number() != expected_seq {
            return Err(Error::Value(format!(
                "sequence number mismatch: expected {}, actual {}",
                expected_seq,
                existing.sequence_number()
            )));
        }
        if incoming.sequence_number() <= existing.sequence_number() {
            return Err(Error::Value(format!(
                "sequence number less than or equal to current: {} <= {}",
                incoming.sequence_number(),
                existing.sequence_number()
            )));
        }
        Ok(())
    }
}

impl DataStorage for MemoryStorage {
    fn get_value(&self, value_id: &Id) -> Option<Value> {
        self.values.get(value_id).map(|s| s.value.clone())
    }

    fn put_value(
        &mut self,
        value: Value,
        expected_seq: i32,
        persistent: bool,
        update_last_announce: bool,
        now: u64,
    ) -> Result<Option<Value>> {
        let value_id = value.id();

        let prior = match self.values.get(&value_id) {
            Some(existing) => {
                Self::check_mutable_update(&existing.value, &value, expected_seq)?;
                Some(existing.value.clone())
            }
            None => {
                if expected_seq >= 0 {
                    return Err(Error::Value("no existing value for CAS write".into()));
                }
                None
            }
        };

        match self.values.get_mut(&value_id) {
            Some(stored) => {
                stored.value = value;
                stored.persistent |= persistent;
                stored.created = now;
                if update_last_announce {
                    stored.last_announce = now;
                }
            }
            None => {
                self.values.insert(
                    value_id,
                    StoredValue {
                        value,
                        persistent,
                        created: now,
                        last_announce: if update_last_announce { now } else { 0 },
                    },
                );
            }
        }
        Ok(prior)
    }

    fn update_value_last_announce(&mut self, value_id: &Id, now: u64) {
        if let Some(stored) = self.values.get_mut(value_id) {
            stored.last_announce = now;
        }
    }

    fn persistent_values(&self, before: u64) -> Vec<Value> {
        self.values
            .values()
            .filter(|s| s.persistent && s.last_announce < before)
            .map(|s| s.value.clone())
            .collect()
    }

    fn remove_value(&mut self, value_id: &Id) -> bool {
        self.values.remove(value_id).is_some()
    }

    fn value_ids(&self) -> Vec<Id> {
        self.values.keys().copied().collect()
    }

    fn get_peers(&self, peer_id: &Id, max_peers: usize) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .filter(|((id, _), _)| id == peer_id)
            .take(max_peers)
            .map(|(_, s)| s.peer.clone())
            .collect()
    }

    fn get_peer(&self, peer_id: &Id, origin: &Id) -> Option<PeerInfo> {
        self.peers
            .get(&(*peer_id, *origin))
            .map(|s| s.peer.clone())
    }

    fn put_peer(&mut self, peer: PeerInfo, persistent: bool, update_last_announce: bool, now: u64) {
        let key = (*peer.id(), *peer.origin());
        match self.peers.get_mut(&key) {
            Some(stored) => {
                stored.peer = peer;
                stored.persistent |= persistent;
                stored.created = now;
                if update_last_announce {
                    stored.last_announce = now;
                }
            }
            None => {
                self.peers.insert(
                    key,
                    StoredPeer {
                        peer,
                        persistent,
                        created: now,
                        last_announce: if update_last_announce { now } else { 0 },
                    },
                );
            }
        }
    }

    fn update_peer_last_announce(&mut self, peer_id: &Id, origin: &Id, now: u64) {
        if let Some(stored) = self.peers.get_mut(&(*peer_id, *origin)) {
            stored.last_announce = now;
        }
    }

    fn persistent_peers(&self, before: u64) -> Vec<PeerInfo> {
        self.peers
            .values()
            .filter(|s| s.persistent && s.last_announce < before)
            .map(|s| s.peer.clone())
            .collect()
    }

    fn remove_peer(&mut self, peer_id: &Id, origin: &Id) -> bool {
        self.peers.remove(&(*peer_id, *origin)).is_some()
    }

    fn expire(&mut self, now: u64) {
        self.values.retain(|_, s| {
            s.persistent || now.saturating_sub(s.created) <= constants::MAX_VALUE_AGE
        });
        self.peers.retain(|_, s| {
            s.persistent || now.saturating_sub(s.created) <= constants::MAX_PEER_AGE
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_value_round_trips() {
        let mut storage = MemoryStorage::new();
        let value = Value::create(b"Hello, world").unwrap();
        let id = value.id();

        storage.put_value(value.clone(), -1, false, false, 10).unwrap();
        assert_eq!(storage.get_value(&id), Some(value));
        assert!(storage.remove_value(&id));
        assert_eq!(storage.get_value(&id), None);
    }

    #[test]
    fn cas_semantics() {
        let mut storage = MemoryStorage::new();
        let v0 = Value::create_signed(b"v0").unwrap();
        let id = v0.id();
        storage.put_value(v0.clone(), -1, false, false, 10).unwrap();

        // wrong expectation fails
        let v1 = v0.update(b"v1").unwrap();
        assert!(storage.put_value(v1.clone(), 1, false, false, 11).is_err());

        // right expectation succeeds
        storage.put_value(v1.clone(), 0, false, false, 12).unwrap();
        assert_eq!(storage.get_value(&id).unwrap().sequence_number(), 1);

        // sequence regression fails even without CAS
        assert!(storage.put_value(v0, -1, false, false, 13).is_err());
    }

    #[test]
    fn owned_value_resists_unowned_overwrite() {
        let mut storage = MemoryStorage::new();
        let owned = Value::create_signed(b"mine").unwrap();
        storage.put_value(owned.clone(), -1, true, false, 10).unwrap();

        // strip the private key, bump the seq: still rejected
        let unowned = Value::of(
            owned.public_key().copied(),
            None,
            owned.nonce().copied(),
            owned.signature().map(|s| s.to_vec()),
            owned.sequence_number() + 1,
            b"theirs".to_vec(),
        );
        assert!(storage.put_value(unowned, -1, false, false, 11).is_err());
    }

    #[test]
    fn expiry_spares_persistent_entries() {
        let mut storage = MemoryStorage::new();
        let ephemeral = Value::create(b"ephemeral").unwrap();
        let pinned = Value::create(b"pinned").unwrap();
        let (eid, pid) = (ephemeral.id(), pinned.id());

        storage.put_value(ephemeral, -1, false, false, 0).unwrap();
        storage.put_value(pinned, -1, true, false, 0).unwrap();

        storage.expire(constants::MAX_VALUE_AGE + 1);
        assert_eq!(storage.get_value(&eid), None);
        assert!(storage.get_value(&pid).is_some());
    }

    #[test]
    fn peers_keyed_by_origin() {
        let mut storage = MemoryStorage::new();
        let keypair = lib_crypto::signature::KeyPair::random();
        let peer_id_keys = keypair.public_key();
        let node_a = Id::random();
        let node_b = Id::random();

        let a = PeerInfo::create_with(&keypair, &node_a, &node_a, 8080, None).unwrap();
        let b = PeerInfo::create_with(&keypair, &node_b, &node_b, 8081, None).unwrap();
        let peer_id = Id::from(peer_id_keys);

        storage.put_peer(a, false, false, 10);
        storage.put_peer(b, false, false, 11);

        assert_eq!(storage.get_peers(&peer_id, 8).len(), 2);
        assert_eq!(storage.get_peers(&peer_id, 1).len(), 1);
        assert!(storage.get_peer(&peer_id, &node_a).is_some());
        assert!(storage.remove_peer(&peer_id, &node_a));
        assert_eq!(storage.get_peers(&peer_id, 8).len(), 1);
    }

    #[test]
    fn persistent_reannounce_bookkeeping() {
        let mut storage = MemoryStorage::new();
        let value = Value::create(b"persistent").unwrap();
        let id = value.id();
        storage.put_value(value, -1, true, true, 100).unwrap();

        assert!(storage.persistent_values(100).is_empty());
        assert_eq!(storage.persistent_values(101).len(), 1);

        storage.update_value_last_announce(&id, 500);
        assert!(storage.persistent_values(400).is_empty());
    }
}
