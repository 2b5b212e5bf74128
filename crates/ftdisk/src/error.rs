//! Error types for ftdisk

use std::io;

use thiserror::Error;

/// Result type alias for ftdisk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for block file and log operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header or record could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Log record failed its checksum
    #[error("Checksum mismatch at LSN {lsn}")]
    Checksum {
        /// LSN of the damaged record
        lsn: u64,
    },

    /// Block is not present in the translation index
    #[error("Block {0} not found")]
    NotFound(u64),

    /// Block payload exceeds the per-block limit
    #[error("Block too large: {0} bytes (max 64 MB)")]
    BlockTooLarge(usize),

    /// File was opened read-only
    #[error("File is read-only")]
    ReadOnly,

    /// File does not exist and `create` was not requested
    #[error("File does not exist: {0}")]
    Missing(String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::Parse(format!("{:?}", err))
    }
}
