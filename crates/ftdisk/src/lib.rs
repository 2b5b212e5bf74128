//! # ftdisk
//!
//! On-disk layer underneath the FtStore cachetable.
//!
//! ## Contents
//! - **BlockFile**: data file addressed by block key, with a translation
//!   index that becomes durable at each checkpoint
//! - **LogFile**: segmented, checksummed log of LSN-numbered records used
//!   to bracket checkpoints
//!
//! Everything is positioned I/O (`pread`/`pwrite`), so a single file handle
//! is shared by every writer thread.

#![warn(missing_docs)]

mod error;
mod file;
mod header;
mod log;

pub use error::{Error, Result};
pub use file::{BlockFile, OpenFlags};
pub use header::{LogRecord, RecordKind};
pub use log::{LogFile, Lsn};
