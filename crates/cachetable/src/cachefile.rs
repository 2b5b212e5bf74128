//! Cachefiles: open backing files registered with a cachetable
//!
//! Opening the same path twice returns two handles onto one shared file,
//! so both see the same pairs. The last handle to close writes back every
//! dirty pair of the file (unless discarding), runs the file's `closing`
//! hook and persists its block translation, then unregisters it. Opens of
//! a path that is mid-close wait for the close to finish.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ftdisk::{BlockFile, OpenFlags};
use tracing::{debug, info, warn};

use crate::cachetable::Shared;
use crate::callbacks::{FlushRequest, PairCallbacks};
use crate::error::{Error, Result};
use crate::pair::{CheckpointMark, FileId, Phase, Value};

pub(crate) struct FileShared<V> {
    pub(crate) id: FileId,
    pub(crate) path: PathBuf,
    pub(crate) block: BlockFile,
    pub(crate) callbacks: Arc<dyn PairCallbacks<V>>,
    refs: AtomicUsize,
    closing: AtomicBool,
}

impl<V> FileShared<V> {
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

pub(crate) struct FileRegistry<V> {
    by_path: HashMap<PathBuf, Arc<FileShared<V>>>,
    next_id: u32,
}

impl<V> FileRegistry<V> {
    pub(crate) fn new() -> Self {
        Self {
            by_path: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_path.len()
    }

    pub(crate) fn files(&self) -> Vec<Arc<FileShared<V>>> {
        let mut files: Vec<_> = self.by_path.values().cloned().collect();
        files.sort_by_key(|file| file.id);
        files
    }
}

/// Handle to an open cachefile
///
/// Dropping the handle closes it (writing dirty pairs back); use
/// [`CacheFile::close`] to observe errors or to discard instead.
pub struct CacheFile<V: Value> {
    ct: Arc<Shared<V>>,
    file: Arc<FileShared<V>>,
    closed: AtomicBool,
}

impl<V: Value> CacheFile<V> {
    /// Identity of the underlying file within the cachetable
    pub fn id(&self) -> FileId {
        self.file.id
    }

    /// Resolved path of the backing file
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// The backing block file
    pub fn block_file(&self) -> &BlockFile {
        &self.file.block
    }

    /// Has this handle been closed?
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close this handle
    ///
    /// # Arguments
    /// * `discard` - Drop dirty pairs instead of writing them back (only
    ///   honoured by the last handle of the file)
    ///
    /// # Returns
    /// * `Err(AlreadyClosed)` on a second close of the same handle
    /// * `Err(Panicked)` if a write-back failed during close
    pub fn close(&self, discard: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        self.ct.close_file(&self.file, discard)
    }

    pub(crate) fn shared(&self) -> Result<&Arc<FileShared<V>>> {
        if self.is_closed() {
            return Err(Error::FileClosed);
        }
        Ok(&self.file)
    }

    pub(crate) fn is_for(&self, ct: &Arc<Shared<V>>) -> bool {
        Arc::ptr_eq(&self.ct, ct)
    }
}

impl<V: Value> Drop for CacheFile<V> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.ct.close_file(&self.file, false) {
                warn!("Closing {} on drop failed: {}", self.file.path.display(), e);
            }
        }
    }
}

impl<V: Value> fmt::Debug for CacheFile<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("id", &self.file.id)
            .field("path", &self.file.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry key for a path that may not exist yet
fn registry_key(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

impl<V: Value> Shared<V> {
    pub(crate) fn open_file(
        self: &Arc<Self>,
        path: &Path,
        flags: OpenFlags,
        callbacks: Arc<dyn PairCallbacks<V>>,
    ) -> Result<CacheFile<V>> {
        self.check_usable()?;
        let key = registry_key(path);

        let mut files = self.files.lock();
        loop {
            let closing = match files.by_path.get(&key) {
                Some(existing) if !existing.is_closing() => {
                    let refs = existing.refs.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!("Reopened cachefile {} ({} handles)", key.display(), refs);
                    return Ok(self.handle(Arc::clone(existing)));
                }
                Some(_) => true,
                None => false,
            };
            if !closing {
                break;
            }
            self.files_changed.wait(&mut files);
        }

        let block = BlockFile::open(&key, flags)?;
        let id = FileId(files.next_id);
        files.next_id += 1;
        let file = Arc::new(FileShared {
            id,
            path: key.clone(),
            block,
            callbacks,
            refs: AtomicUsize::new(1),
            closing: AtomicBool::new(false),
        });
        files.by_path.insert(key, Arc::clone(&file));
        info!("Opened cachefile {} as file {}", file.path.display(), id.0);
        Ok(self.handle(file))
    }

    fn handle(self: &Arc<Self>, file: Arc<FileShared<V>>) -> CacheFile<V> {
        CacheFile {
            ct: Arc::clone(self),
            file,
            closed: AtomicBool::new(false),
        }
    }

    fn close_file(&self, file: &Arc<FileShared<V>>, discard: bool) -> Result<()> {
        let discard = discard || self.is_panicked();
        {
            let _files = self.files.lock();
            let prev = file.refs.fetch_sub(1, Ordering::AcqRel);
            if prev > 1 {
                debug!("Closed handle of {} ({} left)", file.path.display(), prev - 1);
                return Ok(());
            }
            file.closing.store(true, Ordering::Release);
        }

        let result = self.retire_file(file, discard);

        self.files.lock().by_path.remove(&file.path);
        self.files_changed.notify_all();
        info!(
            "Closed cachefile {}{}",
            file.path.display(),
            if discard { " (discarded)" } else { "" }
        );
        result
    }

    /// Write back (or drop) every pair of a closing file and unlink it
    ///
    /// Runs with checkpoints excluded, so no pair of the file can be
    /// carrying checkpoint work.
    fn retire_file(&self, file: &FileShared<V>, discard: bool) -> Result<()> {
        let _checkpoint = self.checkpoint.wait_idle();
        let pairs = self.table.read().pairs_of(file.id);
        let mut first_error = None;
        let mut written = 0;

        for pair in &pairs {
            let mut guard = pair.value.write_arc();
            let mut state = pair.state.lock();
            if state.is_gone() {
                continue;
            }
            if state.dirty && !discard {
                let attr = state.attr;
                drop(state);
                let result = match guard.value.as_ref() {
                    Some(value) => file.callbacks.flush(FlushRequest {
                        file: &file.block,
                        key: pair.key.block,
                        value,
                        disk_data: guard.disk_data.as_ref(),
                        attr,
                        for_checkpoint: false,
                        keep_resident: false,
                        is_clone: false,
                    }),
                    None => Ok(attr),
                };
                match result {
                    Ok(_) => {
                        written += 1;
                        self.stats.record_writeback();
                    }
                    Err(err) => {
                        let err = self.panic(format!("write-back of {} on close failed: {}", pair.key, err));
                        first_error.get_or_insert(err);
                    }
                }
                state = pair.state.lock();
            }

            state.phase = Phase::Evicted;
            state.dirty = false;
            state.mark = CheckpointMark::Clean;
            let size = state.attr.size;
            drop(state);

            self.table.write().remove(pair);
            guard.value = None;
            guard.disk_data = None;
            drop(guard);
            self.evictor.shrink(size);
        }
        let left = self.table.read().count_of(file.id);
        debug!(
            "Retired {} pairs of {} ({} written back, {} left)",
            pairs.len(),
            file.path.display(),
            written,
            left
        );

        if !discard && !file.block.is_read_only() && first_error.is_none() {
            let finished = file
                .callbacks
                .closing(&file.block)
                .and_then(|()| file.block.checkpoint().map_err(Into::into));
            if let Err(err) = finished {
                first_error = Some(self.panic(format!(
                    "closing {} failed: {}",
                    file.path.display(),
                    err
                )));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
impl FileShared<u32> {
    /// A standalone file with no-op callbacks, for unit tests
    pub(crate) fn for_tests(dir: &tempfile::TempDir, id: FileId) -> Arc<Self> {
        use crate::error::CallbackError;
        use crate::pair::PairAttr;

        struct NoopCallbacks;

        impl PairCallbacks<u32> for NoopCallbacks {
            fn flush(&self, req: FlushRequest<'_, u32>) -> std::result::Result<PairAttr, CallbackError> {
                Ok(req.attr)
            }
        }

        let path = dir.path().join(format!("unit-{}.ft", id.0));
        Arc::new(FileShared {
            id,
            path: path.clone(),
            block: BlockFile::open(&path, OpenFlags::CREATE).unwrap(),
            callbacks: Arc::new(NoopCallbacks),
            refs: AtomicUsize::new(1),
            closing: AtomicBool::new(false),
        })
    }
}
