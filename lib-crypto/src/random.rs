//! OS randomness helpers

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Fill `buf` with cryptographically secure random bytes.
pub fn fill(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// A fresh random byte vector of length `len`.
pub fn bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn u8_below(bound: u8) -> u8 {
    OsRng.gen_range(0..bound)
}

pub fn u32_below(bound: u32) -> u32 {
    OsRng.gen_range(0..bound)
}

pub fn u64_value() -> u64 {
    OsRng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_values_stay_in_range() {
        for _ in 0..1000 {
            assert!(u8_below(16) < 16);
            assert!(u32_below(10_000) < 10_000);
        }
    }
}
