use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Crypto(#[from] lib_crypto::CryptoError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Network(#[from] std::io::Error),

    #[error("invalid state: {0}")]
    State(&'static str),

    /// The rendezvous refused us with an explicit error packet.
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error(transparent)]
    Dht(#[from] lib_dht::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
