//! Ephemeral key pairs and session key derivation

use std::fmt;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, CryptoResult, PUBLIC_KEY_SIZE, SESSION_KEY_SIZE};

const INITIATOR_TO_RESPONDER: &[u8] = b"cryptotunnel initiator->responder";
const RESPONDER_TO_INITIATOR: &[u8] = b"cryptotunnel responder->initiator";

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We opened the connection (client)
    Initiator,
    /// We accepted the connection (server)
    Responder,
}

/// Key pair for ephemeral key exchange
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new ephemeral key pair
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Consume the key pair, computing the shared secret with the peer and
    /// deriving the session key from it. The secret scalar and the raw
    /// shared secret are zeroed on drop.
    pub fn derive_session_key(self, their_public: &[u8; PUBLIC_KEY_SIZE]) -> CryptoResult<SessionKey> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        SessionKey::from_shared_secret(&shared)
    }
}

/// 32-byte symmetric session key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// HKDF-SHA256 over the raw Diffie-Hellman output, no salt, empty info
    pub fn from_shared_secret(shared: &SharedSecret) -> CryptoResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; SESSION_KEY_SIZE];
        hkdf.expand(&[], &mut okm)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self(okm))
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    /// Derive one key per direction so both counters may start at zero
    /// without ever sealing two plaintexts under the same (key, nonce).
    /// Both peers must split, or neither can open the other's frames.
    pub fn split(&self, role: Role) -> CryptoResult<DirectionalKeys> {
        let hkdf = Hkdf::<Sha256>::from_prk(&self.0)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let expand = |label: &[u8]| -> CryptoResult<SessionKey> {
            let mut okm = [0u8; SESSION_KEY_SIZE];
            hkdf.expand(label, &mut okm)
                .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
            Ok(SessionKey(okm))
        };

        let initiator_to_responder = expand(INITIATOR_TO_RESPONDER)?;
        let responder_to_initiator = expand(RESPONDER_TO_INITIATOR)?;

        Ok(match role {
            Role::Initiator => DirectionalKeys {
                seal: initiator_to_responder,
                open: responder_to_initiator,
            },
            Role::Responder => DirectionalKeys {
                seal: responder_to_initiator,
                open: initiator_to_responder,
            },
        })
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Outbound and inbound keys for one side of a connection
#[derive(Debug, Clone)]
pub struct DirectionalKeys {
    pub seal: SessionKey,
    pub open: SessionKey,
}
