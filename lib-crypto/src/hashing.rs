//! SHA-2 digest helpers

use sha2::{Digest, Sha256};

pub const SHA256_BYTES: usize = 32;

/// SHA-256 over a single buffer.
pub fn sha256(data: &[u8]) -> [u8; SHA256_BYTES] {
    Sha256::digest(data).into()
}

/// SHA-256 over the concatenation of `parts`, without materializing it.
pub fn sha256_multi(parts: &[&[u8]]) -> [u8; SHA256_BYTES] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_matches_concatenation() {
        let joined = sha256(b"hello world");
        let parts = sha256_multi(&[b"hello", b" ", b"world"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
