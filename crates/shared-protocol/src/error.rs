//! Error types for the wire protocol

use thiserror::Error;

/// Protocol error
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown frame type: {0}")]
    UnknownFrameType(i32),

    #[error("Invalid length: {len} (max: {max})")]
    InvalidLength { len: i64, max: usize },

    #[error("Invalid file size: {0}")]
    InvalidFileSize(i64),

    #[error("Filename too long: {len} bytes (max: {max})")]
    FilenameTooLong { len: usize, max: usize },

    #[error("Filename is not valid UTF-8")]
    InvalidFilename,

    #[error("File chunk overruns declared size: {received} > {expected}")]
    ChunkOverrun { expected: u64, received: u64 },

    #[error("Empty file chunk")]
    EmptyChunk,

    #[error("Malformed rekey message: {0}")]
    MalformedRekey(String),

    #[error("Unexpected rekey message: {0}")]
    UnexpectedRekey(&'static str),
}

impl ProtocolError {
    /// True when the peer closed the stream in the middle of a frame
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
