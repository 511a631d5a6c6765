//! DHT values: immutable, signed-mutable and encrypted-mutable.
//!
//! A mutable value is addressed by SHA-256 of its public key and nonce, so
//! re-publishing under a higher sequence number keeps the same value id. An
//! immutable value is addressed by the digest of its bytes.

use std::fmt;

use lib_crypto::{cryptobox, hashing, signature, CryptoBox, Nonce};

use crate::constants;
use crate::error::{Error, Result};
use crate::id::Id;

#[derive(Clone)]
pub struct Value {
    public_key: Option<Id>,
    private_key: Option<signature::PrivateKey>,
    recipient: Option<Id>,
    nonce: Option<Nonce>,
    signature: Option<Vec<u8>>,
    sequence_number: i32,
    data: Vec<u8>,
}

impl Value {
    /// An immutable value: just bytes, addressed by their digest.
    pub fn create(data: &[u8]) -> Result<Value> {
        if data.is_empty() || data.len() > constants::MAX_VALUE_SIZE {
            return Err(Error::Value("invalid value size".into()));
        }
        Ok(Value {
            public_key: None,
            private_key: None,
            recipient: None,
            nonce: None,
            signature: None,
            sequence_number: -1,
            data: data.to_vec(),
        })
    }

    /// A signed mutable value under a fresh random keypair and nonce.
    pub fn create_signed(data: &[u8]) -> Result<Value> {
        Self::create_signed_with(&signature::KeyPair::random(), &Nonce::random(), 0, data)
    }

    pub fn create_signed_with(
        keypair: &signature::KeyPair,
        nonce: &Nonce,
        sequence_number: i32,
        data: &[u8],
    ) -> Result<Value> {
        Self::build(keypair, None, nonce, sequence_number, data)
    }

    /// A mutable value whose body is sealed to `recipient`'s derived X25519
    /// key; the network only ever sees (and signs over) the ciphertext.
    pub fn create_encrypted(recipient: &Id, data: &[u8]) -> Result<Value> {
        Self::create_encrypted_with(&signature::KeyPair::random(), recipient, &Nonce::random(), 0, data)
    }

    pub fn create_encrypted_with(
        keypair: &signature::KeyPair,
        recipient: &Id,
        nonce: &Nonce,
        sequence_number: i32,
        data: &[u8],
    ) -> Result<Value> {
        Self::build(keypair, Some(*recipient), nonce, sequence_number, data)
    }

    fn build(
        keypair: &signature::KeyPair,
        recipient: Option<Id>,
        nonce: &Nonce,
        sequence_number: i32,
        data: &[u8],
    ) -> Result<Value> {
        if data.is_empty() || data.len() > constants::MAX_VALUE_SIZE {
            return Err(Error::Value("invalid value size".into()));
        }
        if sequence_number < 0 {
            return Err(Error::Value("invalid sequence number".into()));
        }

        let body = match &recipient {
            Some(recipient) => {
                let enc = cryptobox::KeyPair::from_signature_keypair(keypair);
                let recipient_pk = recipient.to_encryption_key()?;
                CryptoBox::new(&recipient_pk, enc.private_key()).encrypt(data, nonce)?
            }
            None => data.to_vec(),
        };

        let mut value = Value {
            public_key: Some(Id::from(keypair.public_key())),
            private_key: Some(keypair.private_key().clone()),
            recipient,
            nonce: Some(*nonce),
            signature: None,
            sequence_number,
            data: body,
        };
        value.signature = Some(keypair.sign(&value.sign_data()).to_vec());
        Ok(value)
    }

    /// Reassemble a value received from the wire or storage.
    pub fn of(
        public_key: Option<Id>,
        recipient: Option<Id>,
        nonce: Option<Nonce>,
        signature: Option<Vec<u8>>,
        sequence_number: i32,
        data: Vec<u8>,
    ) -> Value {
        Value {
            public_key,
            private_key: None,
            recipient,
            nonce,
            signature,
            sequence_number,
            data,
        }
    }

    /// The value id this value is stored and looked up under.
    pub fn id(&self) -> Id {
        let digest = match (&self.public_key, &self.nonce) {
            (Some(pk), Some(nonce)) => hashing::sha256_multi(&[pk.as_bytes(), nonce.as_bytes()]),
            _ => hashing::sha256(&self.data),
        };
        Id::from_bytes(&digest).expect("digest is id-sized")
    }

    pub fn public_key(&self) -> Option<&Id> {
        self.public_key.as_ref()
    }

    pub fn recipient(&self) -> Option<&Id> {
        self.recipient.as_ref()
    }

    pub fn nonce(&self) -> Option<&Nonce> {
        self.nonce.as_ref()
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn sequence_number(&self) -> i32 {
        self.sequence_number
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_mutable(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.recipient.is_some()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    fn sign_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96 + self.data.len());
        if let Some(pk) = &self.public_key {
            buf.extend_from_slice(pk.as_bytes());
        }
        if let Some(recipient) = &self.recipient {
            buf.extend_from_slice(recipient.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            buf.extend_from_slice(nonce.as_bytes());
        }
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Signature check for mutable values; immutable values are valid when
    /// non-empty.
    pub fn is_valid(&self) -> bool {
        if self.data.is_empty() || self.data.len() > constants::MAX_VALUE_SIZE {
            return false;
        }
        let Some(public_key) = &self.public_key else {
            return true;
        };
        let (Some(signature), Some(_nonce)) = (&self.signature, &self.nonce) else {
            return false;
        };
        let Ok(pk) = public_key.to_signature_key() else {
            return false;
        };
        pk.verify(&self.sign_data(), signature).is_ok()
    }

    /// Re-publish with new bytes: bumps the sequence number and re-signs
    /// under the same keypair and nonce. Requires the private key.
    pub fn update(&self, data: &[u8]) -> Result<Value> {
        let private_key = self
            .private_key
            .as_ref()
            .ok_or(Error::State("value has no private key"))?;
        let nonce = self.nonce.ok_or(Error::State("value has no nonce"))?;
        let keypair = signature::KeyPair::from_private_key(private_key.clone());

        let next_seq = self.sequence_number + 1;
        match &self.recipient {
            Some(recipient) => {
                Self::create_encrypted_with(&keypair, recipient, &nonce, next_seq, data)
            }
            None => Self::create_signed_with(&keypair, &nonce, next_seq, data),
        }
    }

    /// Open an encrypted value's body. `keypair` is the recipient identity.
    pub fn decrypt_data(&self, keypair: &signature::KeyPair) -> Result<Vec<u8>> {
        let public_key = self
            .public_key
            .as_ref()
            .ok_or(Error::Value("value is not mutable".into()))?;
        if self.recipient.is_none() {
            return Err(Error::Value("value is not encrypted".into()));
        }
        let nonce = self.nonce.ok_or(Error::Value("value has no nonce".into()))?;

        let sender_pk = public_key.to_encryption_key()?;
        let enc = cryptobox::KeyPair::from_signature_keypair(keypair);
        let plain = CryptoBox::new(&sender_pk, enc.private_key()).decrypt(&self.data, &nonce)?;
        Ok(plain)
    }

    /// Rough storage footprint, for accounting and limits.
    pub fn size(&self) -> usize {
        self.data.len() + self.signature.as_ref().map_or(0, |s| s.len())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        // private keys are local-only and never part of identity
        self.public_key == other.public_key
            && self.recipient == other.recipient
            && self.nonce == other.nonce
            && self.signature == other.signature
            && self.sequence_number == other.sequence_number
            && self.data == other.data
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("id", &self.id())
            .field("mutable", &self.is_mutable())
            .field("encrypted", &self.is_encrypted())
            .field("seq", &self.sequence_number)
            .field("size", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_id_is_data_digest() {
        let value = Value::create(b"Hello, world").unwrap();
        assert!(!value.is_mutable());
        assert!(value.is_valid());

        let expected = hashing::sha256(b"Hello, world");
        assert_eq!(value.id().as_bytes(), &expected);
    }

    #[test]
    fn signed_value_verifies_and_updates() {
        let value = Value::create_signed(b"v0").unwrap();
        assert!(value.is_valid());
        assert_eq!(value.sequence_number(), 0);

        let updated = value.update(b"v1").unwrap();
        assert!(updated.is_valid());
        assert_eq!(updated.sequence_number(), 1);
        // same keypair and nonce: the value id is stable across updates
        assert_eq!(updated.id(), value.id());
    }

    #[test]
    fn tampered_value_fails_verification() {
        let value = Value::create_signed(b"payload").unwrap();
        let tampered = Value::of(
            value.public_key().copied(),
            None,
            value.nonce().copied(),
            value.signature().map(|s| s.to_vec()),
            value.sequence_number(),
            b"other payload".to_vec(),
        );
        assert!(!tampered.is_valid());
    }

    #[test]
    fn encrypted_value_round_trips() {
        let recipient = signature::KeyPair::random();
        let recipient_id = Id::from(recipient.public_key());

        let value = Value::create_encrypted(&recipient_id, b"for your eyes only").unwrap();
        assert!(value.is_valid());
        assert!(value.is_encrypted());
        assert_ne!(value.data(), b"for your eyes only");

        let plain = value.decrypt_data(&recipient).unwrap();
        assert_eq!(plain, b"for your eyes only");
    }

    #[test]
    fn oversized_value_rejected() {
        let data = vec![0u8; constants::MAX_VALUE_SIZE + 1];
        assert!(Value::create(&data).is_err());
    }
}
