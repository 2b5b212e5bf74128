//! Error types for the cachetable

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::pair::PairKey;

/// Result type alias for cachetable operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a client callback (fetch, flush, log, ...)
///
/// Shared and cloneable so one failed fetch can be reported to every
/// thread that was waiting on it.
#[derive(Clone)]
pub struct CallbackError(Arc<dyn StdError + Send + Sync>);

impl CallbackError {
    /// Wrap any error
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        CallbackError(Arc::new(err))
    }
}

impl fmt::Debug for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for CallbackError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<io::Error> for CallbackError {
    fn from(err: io::Error) -> Self {
        CallbackError::new(err)
    }
}

impl From<ftdisk::Error> for CallbackError {
    fn from(err: ftdisk::Error) -> Self {
        CallbackError::new(err)
    }
}

impl From<String> for CallbackError {
    fn from(msg: String) -> Self {
        CallbackError(Arc::from(Box::<dyn StdError + Send + Sync>::from(msg)))
    }
}

impl From<&str> for CallbackError {
    fn from(msg: &str) -> Self {
        CallbackError::from(msg.to_string())
    }
}

/// Error types for cachetable operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The fetch callback failed; every waiter on the same miss sees this
    #[error("Fetch of {key} failed: {source}")]
    Fetch {
        /// Pair that could not be fetched
        key: PairKey,
        /// Callback failure
        source: CallbackError,
    },

    /// The partial fetch callback failed; the pair stays resident
    #[error("Partial fetch of {key} failed: {source}")]
    PartialFetch {
        /// Pair that could not be completed
        key: PairKey,
        /// Callback failure
        source: CallbackError,
    },

    /// A write-back failed earlier; the cachetable refuses all work
    #[error("Cachetable panicked: {0}")]
    Panicked(Arc<str>),

    /// Operation on a cachefile that has been closed
    #[error("Cachefile is closed")]
    FileClosed,

    /// `close` called twice on the same cachefile handle
    #[error("Cachefile already closed")]
    AlreadyClosed,

    /// Cachetable shutdown requested while cachefiles remain open
    #[error("{0} cachefiles still open")]
    FilesStillOpen(usize),

    /// `put` of a key that is already resident
    #[error("Pair {0} already exists")]
    DuplicateKey(PairKey),

    /// The operation needs a write pin
    #[error("Pair {0} is pinned for read")]
    NotWritePinned(PairKey),

    /// `begin_checkpoint` while another checkpoint runs
    #[error("Checkpoint already in progress")]
    CheckpointInProgress,

    /// `end_checkpoint` without a matching `begin_checkpoint`
    #[error("No checkpoint in progress")]
    NoCheckpointInProgress,

    /// The checkpoint log collaborator failed
    #[error("Log error: {0}")]
    Log(CallbackError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Opening or syncing a backing file failed
    #[error("Disk error: {0}")]
    Disk(Arc<ftdisk::Error>),

    /// The cachetable has been shut down
    #[error("Cachetable is shut down")]
    ShutDown,
}

impl From<ftdisk::Error> for Error {
    fn from(err: ftdisk::Error) -> Self {
        Error::Disk(Arc::new(err))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Disk(Arc::new(ftdisk::Error::Io(err)))
    }
}
