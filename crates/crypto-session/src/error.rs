//! Crypto session error types

use thiserror::Error;

/// Cryptographic operation error
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("Invalid public key: peer sent a low-order point")]
    InvalidPublicKey,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Cipher initialization failed: {0}")]
    CipherInit(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: authentication tag mismatch")]
    AuthenticationFailed,

    #[error("Nonce overflow: maximum message count exceeded")]
    NonceOverflow,
}

impl CryptoError {
    /// Errors raised while the initial key exchange is still in progress
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::Handshake(_) | Self::InvalidPublicKey)
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;
