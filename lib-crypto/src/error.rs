use thiserror::Error;

/// Errors surfaced by the crypto primitives.
///
/// Callers on the datagram path treat any of these as "drop silently";
/// the variants exist so setup code can report what actually failed.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonce { expected: usize, actual: usize },
}
