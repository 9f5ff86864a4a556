//! Frame layout for the tunnel byte stream
//!
//! ```text
//! message:  i32 type=0 | i32 len | ciphertext[len]
//! file:     i32 type=1 | u16 name_len | name | i64 total_size
//!           then per chunk: i32 len | ciphertext[len]
//! rekey:    i32 type=2 | i32 len | ciphertext[len]
//! ```
//!
//! All integers are big-endian.

use std::io::{self, Read, Write};

use bytes::{BufMut, BytesMut};

use crate::{FILE_CHUNK_SIZE, MAX_FILENAME_LEN, MAX_SEALED_LEN, ProtocolError, ProtocolResult};

/// Type tag leading every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameType {
    /// Sealed UTF-8 text message
    Message = 0,
    /// File transfer header followed by sealed chunks
    File = 1,
    /// Sealed key rotation control message
    Rekey = 2,
}

impl TryFrom<i32> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Message),
            1 => Ok(FrameType::File),
            2 => Ok(FrameType::Rekey),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// Header of a file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Name announced by the sender
    pub filename: String,
    /// Sum of the plaintext lengths of all chunks that follow
    pub total_size: u64,
}

impl FileHeader {
    pub fn new(filename: impl Into<String>, total_size: u64) -> Self {
        Self {
            filename: filename.into(),
            total_size,
        }
    }

    /// Number of chunks the sender emits for this file
    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(FILE_CHUNK_SIZE as u64)
    }
}

/// Decoded frame header; payload bytes are read separately
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameHeader {
    Message { len: usize },
    File(FileHeader),
    Rekey { len: usize },
}

/// Reads frames from a blocking byte stream
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame header.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub fn read_header(&mut self) -> ProtocolResult<Option<FrameHeader>> {
        let mut raw = [0u8; 4];
        if !self.read_frame_start(&mut raw)? {
            return Ok(None);
        }

        let header = match FrameType::try_from(i32::from_be_bytes(raw))? {
            FrameType::Message => FrameHeader::Message {
                len: self.read_length()?,
            },
            FrameType::File => FrameHeader::File(self.read_file_header()?),
            FrameType::Rekey => FrameHeader::Rekey {
                len: self.read_length()?,
            },
        };

        Ok(Some(header))
    }

    /// Read exactly `len` payload bytes announced by a header
    pub fn read_payload(&mut self, len: usize) -> ProtocolResult<Vec<u8>> {
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read one length-prefixed file chunk
    pub fn read_chunk(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.read_length()?;
        self.read_payload(len)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn read_frame_start(&mut self, buf: &mut [u8; 4]) -> ProtocolResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn read_length(&mut self) -> ProtocolResult<usize> {
        let mut raw = [0u8; 4];
        self.inner.read_exact(&mut raw)?;
        let len = i32::from_be_bytes(raw);

        match usize::try_from(len) {
            Ok(len) if len <= MAX_SEALED_LEN => Ok(len),
            _ => Err(ProtocolError::InvalidLength {
                len: len.into(),
                max: MAX_SEALED_LEN,
            }),
        }
    }

    fn read_file_header(&mut self) -> ProtocolResult<FileHeader> {
        let mut raw_len = [0u8; 2];
        self.inner.read_exact(&mut raw_len)?;
        let name = self.read_payload(u16::from_be_bytes(raw_len) as usize)?;
        let filename = String::from_utf8(name).map_err(|_| ProtocolError::InvalidFilename)?;

        let mut raw_size = [0u8; 8];
        self.inner.read_exact(&mut raw_size)?;
        let size = i64::from_be_bytes(raw_size);
        let total_size = u64::try_from(size).map_err(|_| ProtocolError::InvalidFileSize(size))?;

        Ok(FileHeader {
            filename,
            total_size,
        })
    }
}

/// Writes frames to a byte stream.
///
/// Each call emits a complete wire unit with a single `write_all`; callers
/// serialize access so units from different frames never interleave.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_message(&mut self, ciphertext: &[u8]) -> ProtocolResult<()> {
        self.write_sealed(FrameType::Message, ciphertext)
    }

    pub fn write_rekey(&mut self, ciphertext: &[u8]) -> ProtocolResult<()> {
        self.write_sealed(FrameType::Rekey, ciphertext)
    }

    pub fn write_file_header(&mut self, header: &FileHeader) -> ProtocolResult<()> {
        let name = header.filename.as_bytes();
        if name.len() > MAX_FILENAME_LEN {
            return Err(ProtocolError::FilenameTooLong {
                len: name.len(),
                max: MAX_FILENAME_LEN,
            });
        }
        let total_size = i64::try_from(header.total_size)
            .map_err(|_| ProtocolError::InvalidFileSize(i64::MAX))?;

        let mut buf = BytesMut::with_capacity(4 + 2 + name.len() + 8);
        buf.put_i32(FrameType::File as i32);
        buf.put_u16(name.len() as u16);
        buf.put_slice(name);
        buf.put_i64(total_size);
        self.inner.write_all(&buf)?;
        Ok(())
    }

    pub fn write_chunk(&mut self, ciphertext: &[u8]) -> ProtocolResult<()> {
        let len = checked_len(ciphertext)?;
        let mut buf = BytesMut::with_capacity(4 + ciphertext.len());
        buf.put_i32(len);
        buf.put_slice(ciphertext);
        self.inner.write_all(&buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> ProtocolResult<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn write_sealed(&mut self, frame_type: FrameType, ciphertext: &[u8]) -> ProtocolResult<()> {
        let len = checked_len(ciphertext)?;
        let mut buf = BytesMut::with_capacity(8 + ciphertext.len());
        buf.put_i32(frame_type as i32);
        buf.put_i32(len);
        buf.put_slice(ciphertext);
        self.inner.write_all(&buf)?;
        Ok(())
    }
}

fn checked_len(payload: &[u8]) -> ProtocolResult<i32> {
    if payload.len() > MAX_SEALED_LEN {
        return Err(ProtocolError::InvalidLength {
            len: payload.len() as i64,
            max: MAX_SEALED_LEN,
        });
    }
    Ok(payload.len() as i32)
}
