//! Shared Protocol Definitions for CryptoTunnel
//!
//! Wire representation of the tunnel: frame types, file-transfer headers,
//! length-prefixed chunks and the rekey control messages. Everything here
//! moves opaque ciphertext; sealing and opening live in `crypto-session`.

mod error;
mod frames;
mod rekey;

pub use error::*;
pub use frames::*;
pub use rekey::*;

/// Plaintext bytes per sealed file chunk
pub const FILE_CHUNK_SIZE: usize = 1024;

/// Upper bound accepted for a single sealed payload on the wire
pub const MAX_SEALED_LEN: usize = 16 * 1024 * 1024;

/// Longest filename representable in a file header (u16 length prefix)
pub const MAX_FILENAME_LEN: usize = u16::MAX as usize;

/// Size of an X25519 public key carried in rekey messages
pub const REKEY_PUBLIC_KEY_SIZE: usize = 32;
