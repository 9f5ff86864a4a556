//! One direction of an established session: key plus nonce counter

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};

use crate::{CryptoError, CryptoResult, NONCE_SIZE, SessionKey, TAG_SIZE};

/// Build the 96-bit nonce for a counter value.
///
/// Nonce format: [8 bytes big-endian counter][4 zero bytes]
pub fn nonce_for_counter(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Sealing or opening state for one direction of a connection.
///
/// The sender's and the receiver's instance for the same direction hold the
/// same key and advance their counters in transmission order.
pub struct SecureSession {
    cipher: ChaCha20Poly1305,
    counter: u64,
    /// Number of rotations applied since the handshake
    epoch: u64,
}

impl SecureSession {
    pub fn new(key: &SessionKey) -> CryptoResult<Self> {
        Ok(Self {
            cipher: Self::cipher(key)?,
            counter: 0,
            epoch: 0,
        })
    }

    fn cipher(key: &SessionKey) -> CryptoResult<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::CipherInit(e.to_string()))
    }

    /// Encrypt and authenticate with the next nonce
    ///
    /// Returns: [ciphertext][16-byte auth tag]
    pub fn seal(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }

        let nonce_bytes = nonce_for_counter(self.counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        self.counter += 1;

        Ok(ciphertext)
    }

    /// Verify and decrypt with the next expected nonce
    pub fn open(&mut self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }

        if self.counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }

        let nonce_bytes = nonce_for_counter(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        self.counter += 1;

        Ok(plaintext)
    }

    /// Switch to a new key. The counter restarts at zero for the new key.
    pub fn rotate(&mut self, key: &SessionKey) -> CryptoResult<()> {
        self.cipher = Self::cipher(key)?;
        self.counter = 0;
        self.epoch += 1;
        Ok(())
    }

    /// Counter value the next seal/open will use
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
