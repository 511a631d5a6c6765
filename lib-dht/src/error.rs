use thiserror::Error;

/// Error codes carried in wire-level `error` replies.
pub mod codes {
    pub const PROTOCOL_ERROR: i32 = 203;
    pub const VALUE_ERROR: i32 = 206;
}

/// DHT-level error taxonomy.
///
/// The dispositions follow one rule set everywhere: crypto failures drop the
/// datagram without a reply, protocol failures answer with code 203, value
/// failures with 206, network failures escalate on setup and close/retry in
/// steady state, and state failures fail the caller's future.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Crypto(#[from] lib_crypto::CryptoError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Network(#[from] std::io::Error),

    #[error("value error: {0}")]
    Value(String),

    #[error("invalid state: {0}")]
    State(&'static str),

    /// A remote answered one of our requests with an `error` message.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },
}

impl Error {
    /// The wire code used when this error is reported to a peer.
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::Value(_) => codes::VALUE_ERROR,
            _ => codes::PROTOCOL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
