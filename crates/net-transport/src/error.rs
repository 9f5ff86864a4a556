//! Transport error types

use std::path::PathBuf;

use crypto_session::CryptoError;
use shared_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(#[source] CryptoError),

    #[error("Authentication failed: ciphertext rejected")]
    Authentication,

    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    #[error("Protocol desync: {0}")]
    ProtocolDesync(#[source] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File changed while sending: expected {expected} bytes, read {actual}")]
    FileChanged { expected: u64, actual: u64 },

    #[error("Invalid file path: {0}")]
    InvalidPath(PathBuf),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Config error: {0}")]
    Config(String),
}

impl From<CryptoError> for TransportError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => Self::Authentication,
            other => Self::Crypto(other),
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            other => Self::ProtocolDesync(other),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
