//! Key rotation control messages
//!
//! Carried sealed inside `FrameType::Rekey` frames. Layout of the plaintext:
//! one kind byte, followed by a 32-byte public key for offers and accepts.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{ProtocolError, ProtocolResult, REKEY_PUBLIC_KEY_SIZE};

const KIND_OFFER: u8 = 0x01;
const KIND_ACCEPT: u8 = 0x02;
const KIND_CONFIRM: u8 = 0x03;

/// Rekey handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyMessage {
    /// Rotating side proposes a fresh ephemeral public key
    Offer([u8; REKEY_PUBLIC_KEY_SIZE]),
    /// Peer answers with its own fresh key; its outbound direction switches after this frame
    Accept([u8; REKEY_PUBLIC_KEY_SIZE]),
    /// Rotating side's outbound direction switches after this frame
    Confirm,
}

impl RekeyMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Accept(_) => "accept",
            Self::Confirm => "confirm",
        }
    }

    /// Serialize to the plaintext that gets sealed
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + REKEY_PUBLIC_KEY_SIZE);
        match self {
            Self::Offer(public) => {
                buf.put_u8(KIND_OFFER);
                buf.put_slice(public);
            }
            Self::Accept(public) => {
                buf.put_u8(KIND_ACCEPT);
                buf.put_slice(public);
            }
            Self::Confirm => buf.put_u8(KIND_CONFIRM),
        }
        buf.freeze()
    }

    /// Parse an opened rekey payload
    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        let (&kind, rest) = data
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedRekey("empty payload".to_string()))?;

        match kind {
            KIND_OFFER => Ok(Self::Offer(public_key(rest)?)),
            KIND_ACCEPT => Ok(Self::Accept(public_key(rest)?)),
            KIND_CONFIRM if rest.is_empty() => Ok(Self::Confirm),
            KIND_CONFIRM => Err(ProtocolError::MalformedRekey(format!(
                "confirm carries {} trailing bytes",
                rest.len()
            ))),
            other => Err(ProtocolError::MalformedRekey(format!(
                "unknown kind 0x{:02x}",
                other
            ))),
        }
    }
}

fn public_key(data: &[u8]) -> ProtocolResult<[u8; REKEY_PUBLIC_KEY_SIZE]> {
    data.try_into().map_err(|_| {
        ProtocolError::MalformedRekey(format!(
            "public key is {} bytes, expected {}",
            data.len(),
            REKEY_PUBLIC_KEY_SIZE
        ))
    })
}
