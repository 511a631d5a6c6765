//! X25519 authenticated encryption
//!
//! The overlay derives its encryption keys from the Ed25519 identity via the
//! standard birational map, then boxes payloads with XSalsa20-Poly1305. The
//! [`CryptoBox`] type holds the precomputed shared key for one peer; callers
//! that talk to many peers cache these per recipient.

use crypto_box::aead::{Aead, Payload};
use crypto_box::SalsaBox;
use curve25519_dalek::edwards::CompressedEdwardsY;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::signature;
use crate::Result;

/// X25519 key length
pub const KEY_BYTES: usize = 32;

/// Poly1305 authenticator length prepended to every ciphertext
pub const MAC_BYTES: usize = 16;

/// XSalsa20 nonce length
pub const NONCE_BYTES: usize = 24;

/// An X25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(crypto_box::PublicKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("X25519 public key must be 32 bytes"))?;
        Ok(PublicKey(crypto_box::PublicKey::from(raw)))
    }

    /// Convert an Ed25519 verification key to its X25519 counterpart.
    pub fn from_signature_key(pk: &signature::PublicKey) -> Result<Self> {
        let edwards = CompressedEdwardsY(*pk.as_bytes())
            .decompress()
            .ok_or(CryptoError::InvalidKey("not a valid Ed25519 point"))?;
        let montgomery = edwards.to_montgomery();
        Ok(PublicKey(crypto_box::PublicKey::from(montgomery.to_bytes())))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.as_bytes()))
    }
}

/// An X25519 secret key.
#[derive(Clone)]
pub struct PrivateKey(crypto_box::SecretKey);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("X25519 secret key must be 32 bytes"))?;
        Ok(PrivateKey(crypto_box::SecretKey::from(raw)))
    }

    /// Convert an Ed25519 seed to the matching X25519 secret:
    /// the first half of SHA-512(seed), clamped by the scalar multiply.
    pub fn from_signature_key(sk: &signature::PrivateKey) -> Self {
        let digest = Sha512::digest(sk.as_bytes());
        let mut raw = [0u8; KEY_BYTES];
        raw.copy_from_slice(&digest[..KEY_BYTES]);
        let key = PrivateKey(crypto_box::SecretKey::from(raw));
        raw.zeroize();
        key
    }

    pub fn to_bytes(&self) -> [u8; KEY_BYTES] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// An X25519 keypair.
#[derive(Clone)]
pub struct KeyPair {
    sk: PrivateKey,
    pk: PublicKey,
}

impl KeyPair {
    pub fn random() -> Self {
        let mut raw = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut raw);
        let sk = crypto_box::SecretKey::from(raw);
        raw.zeroize();
        let pk = sk.public_key();
        KeyPair {
            sk: PrivateKey(sk),
            pk: PublicKey(pk),
        }
    }

    pub fn from_private_key(sk: PrivateKey) -> Self {
        let pk = sk.0.public_key();
        KeyPair {
            sk,
            pk: PublicKey(pk),
        }
    }

    /// Derive the encryption keypair that belongs to a signing identity.
    pub fn from_signature_keypair(kp: &signature::KeyPair) -> Self {
        Self::from_private_key(PrivateKey::from_signature_key(kp.private_key()))
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.sk
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.pk
    }
}

/// A 24-byte XSalsa20 nonce.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_BYTES]);

impl Nonce {
    pub fn random() -> Self {
        let mut raw = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut raw);
        Nonce(raw)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; NONCE_BYTES] = bytes.try_into().map_err(|_| CryptoError::InvalidNonce {
            expected: NONCE_BYTES,
            actual: bytes.len(),
        })?;
        Ok(Nonce(raw))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_BYTES] {
        &self.0
    }

    /// Big-endian increment, wrapping at the top. Proxy sessions step the
    /// nonce once per encrypted frame.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut().rev() {
            let (v, carry) = byte.overflowing_add(1);
            *byte = v;
            if !carry {
                break;
            }
        }
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

/// A precomputed box for one (local secret, remote public) pair.
pub struct CryptoBox(SalsaBox);

impl CryptoBox {
    pub fn new(pk: &PublicKey, sk: &PrivateKey) -> Self {
        CryptoBox(SalsaBox::new(&pk.0, &sk.0))
    }

    /// Seal `plain`; the result is MAC_BYTES longer than the input.
    pub fn encrypt(&self, plain: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
        self.0
            .encrypt(nonce.as_bytes().into(), Payload::from(plain))
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open `cipher` produced by [`encrypt`](Self::encrypt) under the same nonce.
    pub fn decrypt(&self, cipher: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
        if cipher.len() < MAC_BYTES {
            return Err(CryptoError::DecryptionFailed);
        }
        self.0
            .decrypt(nonce.as_bytes().into(), Payload::from(cipher))
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_round_trip() {
        let alice = KeyPair::random();
        let bob = KeyPair::random();
        let nonce = Nonce::random();

        let sealed = CryptoBox::new(bob.public_key(), alice.private_key())
            .encrypt(b"over the wire", &nonce)
            .unwrap();
        assert_eq!(sealed.len(), b"over the wire".len() + MAC_BYTES);

        let opened = CryptoBox::new(alice.public_key(), bob.private_key())
            .decrypt(&sealed, &nonce)
            .unwrap();
        assert_eq!(opened, b"over the wire");
    }

    #[test]
    fn wrong_nonce_fails() {
        let alice = KeyPair::random();
        let bob = KeyPair::random();

        let sealed = CryptoBox::new(bob.public_key(), alice.private_key())
            .encrypt(b"payload", &Nonce::random())
            .unwrap();
        let result = CryptoBox::new(alice.public_key(), bob.private_key())
            .decrypt(&sealed, &Nonce::random());
        assert!(result.is_err());
    }

    #[test]
    fn derived_keys_agree() {
        // Deriving both sides from signing identities must yield a working box
        let sig_a = signature::KeyPair::random();
        let sig_b = signature::KeyPair::random();

        let enc_a = KeyPair::from_signature_keypair(&sig_a);
        let enc_b = KeyPair::from_signature_keypair(&sig_b);

        // b only knows a's *signature* public key
        let a_pk = PublicKey::from_signature_key(sig_a.public_key()).unwrap();
        assert_eq!(a_pk.as_bytes(), enc_a.public_key().as_bytes());

        let nonce = Nonce::random();
        let sealed = CryptoBox::new(&a_pk, enc_b.private_key())
            .encrypt(b"derived", &nonce)
            .unwrap();
        let opened = CryptoBox::new(enc_b.public_key(), enc_a.private_key())
            .decrypt(&sealed, &nonce)
            .unwrap();
        assert_eq!(opened, b"derived");
    }

    #[test]
    fn nonce_increment_carries() {
        let mut n = Nonce::from_bytes(&[0xffu8; NONCE_BYTES]).unwrap();
        n.increment();
        assert_eq!(n.as_bytes(), &[0u8; NONCE_BYTES]);
    }
}
