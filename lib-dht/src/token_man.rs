//! Stateless write tokens.
//!
//! A token proves the writer recently queried us from the address it now
//! writes from. Nothing is stored per peer: the token is a truncated digest
//! over the caller tuple, a coarse timestamp and a rotating session secret.
//! Verification accepts the current and the previous timestamp, giving every
//! token a five-to-ten minute usable window.

use std::net::{IpAddr, SocketAddr};

use lib_crypto::hashing;

use crate::constants;
use crate::id::Id;

pub struct TokenManager {
    session_secret: [u8; 32],
    timestamp: u64,
    previous_timestamp: u64,
}

impl TokenManager {
    pub fn new() -> Self {
        let mut session_secret = [0u8; 32];
        lib_crypto::random::fill(&mut session_secret);
        TokenManager {
            session_secret,
            timestamp: 0,
            previous_timestamp: 0,
        }
    }

    fn update_timestamps(&mut self, now: u64) {
        if now.saturating_sub(self.timestamp) > constants::TOKEN_TIMEOUT {
            self.previous_timestamp = self.timestamp;
            self.timestamp = now;
        }
    }

    fn token_at(
        &self,
        node_id: &Id,
        addr: &SocketAddr,
        target_id: &Id,
        timestamp: u64,
    ) -> i32 {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        let port = addr.port().to_be_bytes();
        let stamp = timestamp.to_be_bytes();

        let digest = hashing::sha256_multi(&[
            node_id.as_bytes(),
            &ip,
            &port,
            target_id.as_bytes(),
            &stamp,
            &self.session_secret,
        ]);

        // extraction offset keyed by the digest itself
        let pos = (digest[0] & 0x1f) as usize;
        i32::from_be_bytes([
            digest[pos],
            digest[(pos + 1) & 0x1f],
            digest[(pos + 2) & 0x1f],
            digest[(pos + 3) & 0x1f],
        ])
    }

    pub fn generate_token(
        &mut self,
        node_id: &Id,
        addr: &SocketAddr,
        target_id: &Id,
        now: u64,
    ) -> i32 {
        self.update_timestamps(now);
        self.token_at(node_id, addr, target_id, self.timestamp)
    }

    pub fn verify_token(
        &mut self,
        token: i32,
        node_id: &Id,
        addr: &SocketAddr,
        target_id: &Id,
        now: u64,
    ) -> bool {
        self.update_timestamps(now);
        token == self.token_at(node_id, addr, target_id, self.timestamp)
            || token == self.token_at(node_id, addr, target_id, self.previous_timestamp)
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.5:39001".parse().unwrap()
    }

    #[test]
    fn fresh_token_verifies() {
        let mut manager = TokenManager::new();
        let node = Id::random();
        let target = Id::random();

        let token = manager.generate_token(&node, &addr(), &target, 1_000);
        assert!(manager.verify_token(token, &node, &addr(), &target, 1_500));
    }

    #[test]
    fn token_survives_one_rotation_but_not_two() {
        let mut manager = TokenManager::new();
        let node = Id::random();
        let target = Id::random();
        let start = 1_000u64;

        let token = manager.generate_token(&node, &addr(), &target, start);
        // one rotation: previous timestamp still matches
        let after_one = start + constants::TOKEN_TIMEOUT + 1;
        assert!(manager.verify_token(token, &node, &addr(), &target, after_one));
        // second rotation: the minting timestamp is gone
        let after_two = after_one + constants::TOKEN_TIMEOUT + 1;
        assert!(!manager.verify_token(token, &node, &addr(), &target, after_two));
    }

    #[test]
    fn any_tuple_change_invalidates() {
        let mut manager = TokenManager::new();
        let node = Id::random();
        let target = Id::random();
        let token = manager.generate_token(&node, &addr(), &target, 1_000);

        let other_addr: SocketAddr = "203.0.113.5:39002".parse().unwrap();
        assert!(!manager.verify_token(token, &Id::random(), &addr(), &target, 1_100));
        assert!(!manager.verify_token(token, &node, &other_addr, &target, 1_100));
        assert!(!manager.verify_token(token, &node, &addr(), &Id::random(), 1_100));
        assert!(!manager.verify_token(token ^ 1, &node, &addr(), &target, 1_100));
    }
}
