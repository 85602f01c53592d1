//! Error types for the library

use std::time::Duration;

use thiserror::Error;

use crate::ack::Stage;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No device address (or other required setting) could be resolved.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The link could not be established or dropped right after connecting.
    #[error("connection error: {0}")]
    Connection(String),

    /// Any I/O failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport {operation} timed out after {after:?}")]
    TransportTimeout {
        operation: &'static str,
        after: Duration,
    },

    /// Only raised when the session runs in strict mode.
    #[error("no {stage} acknowledgment within {after:?}")]
    AckTimeout { stage: Stage, after: Duration },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("checksum mismatch: header says {expected:#010x}, payload hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("font error: {0}")]
    Font(String),

    #[error("invalid color: {0}")]
    InvalidColor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
