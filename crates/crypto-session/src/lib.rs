//! Crypto Session - key agreement and sealing for CryptoTunnel
//!
//! Provides the ephemeral X25519 handshake, HKDF-SHA256 session key
//! derivation and the per-direction ChaCha20Poly1305 sealing state.

mod error;
mod handshake;
mod keys;
mod session;

pub use error::*;
pub use handshake::*;
pub use keys::*;
pub use session::*;

/// Nonce size for ChaCha20Poly1305 (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Public key size (256 bits / 32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Session key size (256 bits / 32 bytes)
pub const SESSION_KEY_SIZE: usize = 32;
