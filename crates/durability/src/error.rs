//! Durability error type

use std::io;
use tessera_core::Error;
use thiserror::Error;

/// Errors raised by record logs
#[derive(Debug, Error)]
pub enum LogError {
    /// File operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record exceeds the maximum size
    #[error("Record too large: {size} bytes (max {max})")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Stored checksum does not match the record contents
    #[error("Checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Byte offset of the record
        offset: u64,
        /// CRC stored in the file
        expected: u32,
        /// CRC computed from the contents
        actual: u32,
    },

    /// Record is structurally invalid
    #[error("Corrupt record at offset {offset}: {message}")]
    Corrupt {
        /// Byte offset of the record
        offset: u64,
        /// Details
        message: String,
    },
}

impl From<LogError> for Error {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Io(e) => Error::Io(e.to_string()),
            LogError::Serialization(msg) => Error::Serialization(msg),
            LogError::TooLarge { size, max } => {
                Error::BadValue(format!("record of {} bytes exceeds {} bytes", size, max))
            }
            e @ (LogError::ChecksumMismatch { .. } | LogError::Corrupt { .. }) => {
                Error::Corruption(e.to_string())
            }
        }
    }
}
