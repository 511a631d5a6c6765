//! Ed25519 signing identities
//!
//! A node identity is an Ed25519 keypair; the 32-byte public key doubles as
//! the node id on the wire. Private keys are kept in seed form and zeroized
//! on drop.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::Result;

/// Ed25519 signature length
pub const SIGNATURE_BYTES: usize = 64;

/// Ed25519 seed / public key length
pub const KEY_BYTES: usize = 32;

/// An Ed25519 private key, stored as the 32-byte seed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_BYTES]);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ed25519 seed must be 32 bytes"))?;
        Ok(PrivateKey(seed))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// Sign `data`, producing a 64-byte detached signature.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_BYTES] {
        let signing = SigningKey::from_bytes(&self.0);
        signing.sign(data).to_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log secret material
        f.write_str("PrivateKey(..)")
    }
}

/// An Ed25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ed25519 public key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|_| CryptoError::InvalidKey("not a valid Ed25519 point"))?;
        Ok(PublicKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        self.0.as_bytes()
    }

    /// Verify a detached signature over `data`.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        let sig: [u8; SIGNATURE_BYTES] = sig
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig);
        self.0
            .verify(data, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.as_bytes()))
    }
}

/// A signing keypair.
#[derive(Clone)]
pub struct KeyPair {
    sk: PrivateKey,
    pk: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn random() -> Self {
        let mut seed = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut seed);
        let kp = Self::from_seed(&seed);
        seed.zeroize();
        kp
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; KEY_BYTES]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        KeyPair {
            pk: PublicKey(signing.verifying_key()),
            sk: PrivateKey(*seed),
        }
    }

    pub fn from_private_key(sk: PrivateKey) -> Self {
        let signing = SigningKey::from_bytes(sk.as_bytes());
        KeyPair {
            pk: PublicKey(signing.verifying_key()),
            sk,
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.sk
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.pk
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.sk.sign(data)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({:?})", self.pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::random();
        let message = b"meridian signature test";

        let sig = kp.sign(message);
        assert!(kp.public_key().verify(message, &sig).is_ok());
        assert!(kp.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn deterministic_from_seed() {
        let seed = [7u8; KEY_BYTES];
        let a = KeyPair::from_seed(&seed);
        let b = KeyPair::from_seed(&seed);
        assert_eq!(a.public_key().as_bytes(), b.public_key().as_bytes());
    }

    #[test]
    fn rejects_garbage_signature() {
        let kp = KeyPair::random();
        assert!(kp.public_key().verify(b"data", &[0u8; 12]).is_err());
    }
}
