//! 256-bit node identifiers and the XOR metric.
//!
//! An [`Id`] is simultaneously an Ed25519 public key and a position in the
//! key space. Distance is bitwise XOR interpreted as a 256-bit unsigned
//! integer; [`Id::three_way_compare`] is the only ordering lookups use.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use lib_crypto::{cryptobox, signature};

use crate::error::{Error, Result};

pub const ID_BYTES: usize = 32;
pub const ID_BITS: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    pub fn zero() -> Self {
        Id([0u8; ID_BYTES])
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        lib_crypto::random::fill(&mut bytes);
        Id(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; ID_BYTES] = bytes
            .try_into()
            .map_err(|_| Error::Protocol(format!("id must be {} bytes, got {}", ID_BYTES, bytes.len())))?;
        Ok(Id(raw))
    }

    pub fn of_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| Error::Protocol(format!("bad hex id: {}", e)))?;
        Id::from_bytes(&bytes)
    }

    pub fn of_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::Protocol(format!("bad base58 id: {}", e)))?;
        Id::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// XOR distance between two ids, as an id.
    pub fn distance(&self, other: &Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Id(out)
    }

    /// Which of `a`, `b` is closer to `self` under XOR: `Less` means `a`.
    pub fn three_way_compare(&self, a: &Id, b: &Id) -> Ordering {
        for i in 0..ID_BYTES {
            let da = a.0[i] ^ self.0[i];
            let db = b.0[i] ^ self.0[i];
            if da != db {
                return da.cmp(&db);
            }
        }
        Ordering::Equal
    }

    /// True iff the first `depth + 1` bits of `a` and `b` match.
    /// `depth == -1` matches everything.
    pub fn bits_equal(a: &Id, b: &Id, depth: i32) -> bool {
        if depth < 0 {
            return true;
        }
        let bits = depth as usize + 1;
        let whole = bits / 8;
        let rem = bits % 8;

        if a.0[..whole] != b.0[..whole] {
            return false;
        }
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (a.0[whole] ^ b.0[whole]) & mask == 0
    }

    /// Copy the first `depth + 1` bits of `src` over `dest`.
    pub fn bits_copy(src: &Id, dest: &mut Id, depth: i32) {
        if depth < 0 {
            return;
        }
        let bits = depth as usize + 1;
        let whole = bits / 8;
        let rem = bits % 8;

        dest.0[..whole].copy_from_slice(&src.0[..whole]);
        if rem > 0 {
            let mask = 0xffu8 << (8 - rem);
            dest.0[whole] = (dest.0[whole] & !mask) | (src.0[whole] & mask);
        }
    }

    /// Bit at `pos` (0 is the most significant bit).
    pub fn bit(&self, pos: usize) -> bool {
        self.0[pos / 8] & (0x80 >> (pos % 8)) != 0
    }

    pub fn set_bit(&mut self, pos: usize, value: bool) {
        let mask = 0x80u8 >> (pos % 8);
        if value {
            self.0[pos / 8] |= mask;
        } else {
            self.0[pos / 8] &= !mask;
        }
    }

    /// Number of leading zero bits; 256 for the zero id.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// The id as an Ed25519 verification key.
    pub fn to_signature_key(&self) -> Result<signature::PublicKey> {
        Ok(signature::PublicKey::from_bytes(&self.0)?)
    }

    /// The X25519 key derived from the id's Ed25519 point.
    pub fn to_encryption_key(&self) -> Result<cryptobox::PublicKey> {
        Ok(cryptobox::PublicKey::from_signature_key(
            &self.to_signature_key()?,
        )?)
    }
}

impl From<&signature::PublicKey> for Id {
    fn from(pk: &signature::PublicKey) -> Self {
        Id(*pk.as_bytes())
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("0x") {
            Id::of_hex(s)
        } else {
            Id::of_base58(s)
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_base58())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        for _ in 0..64 {
            let a = Id::random();
            let b = Id::random();
            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.distance(&a), Id::zero());
        }
    }

    #[test]
    fn three_way_compare_antisymmetric() {
        for _ in 0..64 {
            let p = Id::random();
            let a = Id::random();
            let b = Id::random();
            assert_eq!(p.three_way_compare(&a, &b), p.three_way_compare(&b, &a).reverse());
        }
        let p = Id::random();
        let a = Id::random();
        assert_eq!(p.three_way_compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn bits_equal_partial_byte() {
        let mut a = Id::zero();
        let mut b = Id::zero();
        a.set_bit(9, true);
        b.set_bit(9, true);
        b.set_bit(10, true);

        assert!(Id::bits_equal(&a, &b, 9));
        assert!(!Id::bits_equal(&a, &b, 10));
        assert!(Id::bits_equal(&a, &b, -1));
    }

    #[test]
    fn bits_copy_preserves_suffix() {
        let src = Id::of_hex("0xff00000000000000000000000000000000000000000000000000000000000000").unwrap();
        let mut dest = Id::of_hex("0x00ff000000000000000000000000000000000000000000000000000000000001").unwrap();
        Id::bits_copy(&src, &mut dest, 3);
        assert_eq!(
            dest.to_hex(),
            "0xf0ff000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn codec_round_trip() {
        let id = Id::random();
        assert_eq!(Id::of_hex(&id.to_hex()).unwrap(), id);
        assert_eq!(Id::of_base58(&id.to_base58()).unwrap(), id);
        assert_eq!(id.to_hex().parse::<Id>().unwrap(), id);
        assert_eq!(id.to_base58().parse::<Id>().unwrap(), id);
    }
}
