use super::TryFromPrimitiveError;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while reading, writing or (de)compressing a whole frame.
///
/// All of these leave the byte stream in an unknown state, so a connection
/// that hits one must be torn down.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,
    #[error("Received a frame from version {0}, but only 4 is supported")]
    VersionNotSupported(u8),
    #[error("Frame declares an invalid body length: {0}")]
    InvalidBodyLength(i64),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(Arc<std::io::Error>),
    #[error("Unrecognized opcode: {0}")]
    TryFromPrimitiveError(#[from] TryFromPrimitiveError<u8>),
    #[error("Error decompressing lz4 data {0}")]
    Lz4DecompressError(Arc<lz4_flex::block::DecompressError>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::StdIoError(Arc::new(err))
    }
}

impl From<lz4_flex::block::DecompressError> for FrameError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        FrameError::Lz4DecompressError(Arc::new(err))
    }
}

/// Errors raised while parsing or serializing a frame body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ParseError {
    #[error("Could not deserialize frame: {0}")]
    BadIncomingData(String),
    #[error("Could not serialize frame: {0}")]
    BadDataToSerialize(String),
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error("Expected {expected} bytes, but only {received} were received")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error(transparent)]
    Utf8Error(#[from] std::str::Utf8Error),
    #[error("Integer conversion out of range: {0}")]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("type not yet implemented, id: {0}")]
    TypeNotImplemented(u16),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::IoError(Arc::new(err))
    }
}
