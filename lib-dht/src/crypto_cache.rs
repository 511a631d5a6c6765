//! Per-peer encryption contexts.
//!
//! Deriving the shared box key for a peer costs an Ed→X25519 conversion and
//! a scalar multiplication, so the node keeps a bounded LRU of precomputed
//! boxes. Entries expire after `KBUCKET_OLD_AND_STALE_TIME`; a scheduled
//! sweep drops the stale ones.

use std::num::NonZeroUsize;

use lru::LruCache;

use lib_crypto::{cryptobox, hashing, CryptoBox, Nonce};

use crate::constants;
use crate::error::Result;
use crate::id::Id;

struct CachedBox {
    ctx: CryptoBox,
    created: u64,
}

pub struct CryptoCache {
    keypair: cryptobox::KeyPair,
    cache: LruCache<Id, CachedBox>,
}

impl CryptoCache {
    pub fn new(keypair: cryptobox::KeyPair) -> Self {
        CryptoCache {
            keypair,
            cache: LruCache::new(
                NonZeroUsize::new(constants::CRYPTO_CACHE_CAPACITY).expect("non-zero capacity"),
            ),
        }
    }

    fn context(&mut self, peer: &Id, now: u64) -> Result<&CryptoBox> {
        let expired = matches!(
            self.cache.peek(peer),
            Some(cached) if now.saturating_sub(cached.created) > constants::KBUCKET_OLD_AND_STALE_TIME
        );
        if expired {
            self.cache.pop(peer);
        }

        if !self.cache.contains(peer) {
            let ctx = CryptoBox::new(&peer.to_encryption_key()?, self.keypair.private_key());
            self.cache.put(*peer, CachedBox { ctx, created: now });
        }
        Ok(&self.cache.get(peer).expect("just inserted").ctx)
    }

    /// The deterministic per-pair nonce: SHA-256(sender || recipient)[0..24].
    fn envelope_nonce(sender: &Id, recipient: &Id) -> Nonce {
        let digest = hashing::sha256_multi(&[sender.as_bytes(), recipient.as_bytes()]);
        Nonce::from_bytes(&digest[..lib_crypto::cryptobox::NONCE_BYTES]).expect("digest long enough")
    }

    /// Seal a payload for `recipient`, as `self_id`.
    pub fn encrypt(
        &mut self,
        self_id: &Id,
        recipient: &Id,
        plain: &[u8],
        now: u64,
    ) -> Result<Vec<u8>> {
        let nonce = Self::envelope_nonce(self_id, recipient);
        let ctx = self.context(recipient, now)?;
        Ok(ctx.encrypt(plain, &nonce)?)
    }

    /// Open a payload from `sender`, as `self_id`.
    pub fn decrypt(
        &mut self,
        self_id: &Id,
        sender: &Id,
        cipher: &[u8],
        now: u64,
    ) -> Result<Vec<u8>> {
        let nonce = Self::envelope_nonce(sender, self_id);
        let ctx = self.context(sender, now)?;
        Ok(ctx.decrypt(cipher, &nonce)?)
    }

    /// Drop contexts older than the expiry window.
    pub fn sweep(&mut self, now: u64) {
        let stale: Vec<Id> = self
            .cache
            .iter()
            .filter(|(_, cached)| {
                now.saturating_sub(cached.created) > constants::KBUCKET_OLD_AND_STALE_TIME
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.cache.pop(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::signature;

    fn identity() -> (Id, signature::KeyPair, cryptobox::KeyPair) {
        let kp = signature::KeyPair::random();
        let id = Id::from(kp.public_key());
        let enc = cryptobox::KeyPair::from_signature_keypair(&kp);
        (id, kp, enc)
    }

    #[test]
    fn peers_can_exchange_sealed_payloads() {
        let (alice_id, _, alice_enc) = identity();
        let (bob_id, _, bob_enc) = identity();

        let mut alice = CryptoCache::new(alice_enc);
        let mut bob = CryptoCache::new(bob_enc);

        let sealed = alice.encrypt(&alice_id, &bob_id, b"dht datagram", 0).unwrap();
        let opened = bob.decrypt(&bob_id, &alice_id, &sealed, 0).unwrap();
        assert_eq!(opened, b"dht datagram");
    }

    #[test]
    fn wrong_sender_fails_decryption() {
        let (alice_id, _, alice_enc) = identity();
        let (bob_id, _, bob_enc) = identity();
        let (eve_id, _, _) = identity();

        let mut alice = CryptoCache::new(alice_enc);
        let mut bob = CryptoCache::new(bob_enc);

        let sealed = alice.encrypt(&alice_id, &bob_id, b"payload", 0).unwrap();
        assert!(bob.decrypt(&bob_id, &eve_id, &sealed, 0).is_err());
    }

    #[test]
    fn sweep_drops_expired_contexts() {
        let (alice_id, _, alice_enc) = identity();
        let (bob_id, _, _) = identity();

        let mut cache = CryptoCache::new(alice_enc);
        cache.encrypt(&alice_id, &bob_id, b"x", 0).unwrap();
        assert_eq!(cache.len(), 1);

        cache.sweep(constants::KBUCKET_OLD_AND_STALE_TIME + 1);
        assert!(cache.is_empty());
    }
}
