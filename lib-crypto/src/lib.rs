//! Meridian cryptography foundation
//!
//! Everything the overlay needs from a crypto library, behind small owned
//! types: Ed25519 signatures for node identity, the derived X25519 box keys
//! for authenticated encryption, SHA-256 digests and OS randomness.

pub mod cryptobox;
pub mod error;
pub mod hashing;
pub mod random;
pub mod signature;

pub use cryptobox::CryptoBox;
pub use cryptobox::Nonce;
pub use error::CryptoError;

/// Result alias used across the crypto modules
pub type Result<T> = std::result::Result<T, CryptoError>;
