//! # cachetable
//!
//! Bounded, concurrent cache of file blocks ("pairs") for the FtStore
//! storage engine.
//!
//! ## Architecture
//! - **Pair table**: arena of pairs indexed by (file, block); each pair's
//!   value sits behind its own read/write lock, which is the pin lock
//! - **Clock eviction**: second-chance sweep with partial eviction, dirty
//!   pairs written back by a background writer pool
//! - **Cachefiles**: reference-counted open files whose last close writes
//!   back their dirty pairs
//! - **Checkpoints**: marking takes snapshots of dirty pairs (deferred for
//!   pairs write-locked at the time) so clients keep running while the
//!   checkpoint is written
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cachetable::{
//!     BlockKey, Cachetable, CachetableConfig, CallbackError, FetchCallbacks, FetchRequest,
//!     Fetched, FlushRequest, PairAttr, PairCallbacks, PinMode,
//! };
//! use ftdisk::OpenFlags;
//!
//! struct Blocks;
//!
//! impl FetchCallbacks<Vec<u8>> for Blocks {
//!     fn fetch(&self, req: FetchRequest<'_>) -> Result<Fetched<Vec<u8>>, CallbackError> {
//!         let bytes = req.file.read_block(req.key.0)?;
//!         let attr = PairAttr::new(bytes.len());
//!         Ok(Fetched::clean(bytes, attr))
//!     }
//! }
//!
//! impl PairCallbacks<Vec<u8>> for Blocks {
//!     fn flush(&self, req: FlushRequest<'_, Vec<u8>>) -> Result<PairAttr, CallbackError> {
//!         req.file.write_block(req.key.0, req.value)?;
//!         Ok(req.attr)
//!     }
//! }
//!
//! # fn main() -> cachetable::Result<()> {
//! let ct = Cachetable::new(CachetableConfig::with_size_limit(64 << 20))?;
//! let file = ct.open_file("/tmp/data.ft", OpenFlags::CREATE, Arc::new(Blocks))?;
//!
//! let mut pinned = ct.put(&file, BlockKey(1), b"hello".to_vec(), PairAttr::new(5))?;
//! if let Some(value) = pinned.value_mut() {
//!     value.extend_from_slice(b", world");
//! }
//! pinned.unpin(true, Some(PairAttr::new(12)))?;
//!
//! let pinned = ct.get_and_pin(&file, BlockKey(1), PinMode::Read, &Blocks)?;
//! assert_eq!(pinned.value(), b"hello, world");
//! drop(pinned);
//!
//! ct.checkpoint()?;
//! file.close(false)?;
//! ct.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod background;
mod cachefile;
mod cachetable;
mod callbacks;
mod checkpoint;
mod cleaner;
mod config;
mod error;
mod evictor;
mod log;
mod pair;
mod pin;
mod pool;
mod stats;
mod table;

pub use crate::cachetable::{Cachetable, PairInfo};
pub use cachefile::CacheFile;
pub use callbacks::{
    CleanerRequest, EvictionCost, FetchCallbacks, FetchRequest, Fetched, FlushRequest,
    PairCallbacks, PartialFetchRequest,
};
pub use checkpoint::OperationGuard;
pub use config::CachetableConfig;
pub use error::{CallbackError, Error, Result};
pub use ftdisk::Lsn;
pub use log::{CheckpointLog, NullLog};
pub use pair::{fullhash, BlockKey, DiskData, FileId, PairAttr, PairKey, Value};
pub use pin::{Dependent, PinMode, PinOutcome, PinnedPair, RetryToken};
pub use stats::{CachetableStats, StatsSnapshot};
