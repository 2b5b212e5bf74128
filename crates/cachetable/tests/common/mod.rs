//! Shared fixtures: byte-vector values stored one per block in a BlockFile

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachetable::{
    BlockKey, CacheFile, Cachetable, CachetableConfig, CallbackError, CleanerRequest,
    DiskData, EvictionCost, FetchCallbacks, FetchRequest, Fetched, FlushRequest, PairAttr,
    PairCallbacks, PartialFetchRequest,
};
use ftdisk::OpenFlags;
use parking_lot::Mutex;
use tempfile::TempDir;

pub type Bytes = Vec<u8>;

/// One call of the flush callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRecord {
    pub block: u64,
    pub bytes: Vec<u8>,
    pub for_checkpoint: bool,
    pub keep_resident: bool,
    pub is_clone: bool,
}

/// Fetch and pair callbacks over a block file, with knobs for tests
#[derive(Default)]
pub struct Blocks {
    pub cloneable: bool,
    /// Partial eviction shrinks values down to this many bytes
    pub shrink_to: Option<usize>,
    /// Fetch sleeps this long before reading
    pub fetch_delay: Option<Duration>,
    pub fail_fetch: AtomicBool,
    pub fail_flush: AtomicBool,
    pub fetches: AtomicUsize,
    pub cleaned: AtomicUsize,
    pub flushes: Mutex<Vec<FlushRecord>>,
    /// Set by `hold_flushes`
    pub gate: Mutex<Option<(flume::Sender<()>, flume::Receiver<()>)>>,
}

impl Blocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cloneable() -> Arc<Self> {
        Arc::new(Self {
            cloneable: true,
            ..Self::default()
        })
    }

    pub fn flushes(&self) -> Vec<FlushRecord> {
        self.flushes.lock().clone()
    }

    pub fn checkpoint_flushes(&self) -> Vec<FlushRecord> {
        self.flushes().into_iter().filter(|r| r.for_checkpoint).collect()
    }

    /// Make the next flushes block: returns (entered, release)
    pub fn hold_flushes(&self) -> (flume::Receiver<()>, flume::Sender<()>) {
        let (entered_tx, entered_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded();
        *self.gate.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn release_flushes(&self) {
        self.gate.lock().take();
    }
}

impl FetchCallbacks<Bytes> for Blocks {
    fn fetch(&self, req: FetchRequest<'_>) -> Result<Fetched<Bytes>, CallbackError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            std::thread::sleep(delay);
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(CallbackError::from("injected fetch failure"));
        }
        let bytes = req.file.read_block(req.key.0)?;
        let attr = PairAttr::new(bytes.len());
        Ok(Fetched::clean(bytes, attr))
    }
}

impl PairCallbacks<Bytes> for Blocks {
    fn flush(&self, req: FlushRequest<'_, Bytes>) -> Result<PairAttr, CallbackError> {
        let gate = self.gate.lock().clone();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(CallbackError::from("injected flush failure"));
        }
        req.file.write_block(req.key.0, req.value)?;
        self.flushes.lock().push(FlushRecord {
            block: req.key.0,
            bytes: req.value.clone(),
            for_checkpoint: req.for_checkpoint,
            keep_resident: req.keep_resident,
            is_clone: req.is_clone,
        });
        Ok(PairAttr::new(req.value.len()))
    }

    fn partial_eviction_estimate(&self, value: &Bytes, _disk_data: Option<&DiskData>) -> (usize, EvictionCost) {
        match self.shrink_to {
            Some(keep) if value.len() > keep => (value.len() - keep, EvictionCost::Cheap),
            _ => (0, EvictionCost::Cheap),
        }
    }

    fn partial_evict(&self, value: &mut Bytes, _disk_data: Option<&mut DiskData>, bytes_to_free: usize) -> usize {
        let freed = bytes_to_free.min(value.len());
        value.truncate(value.len() - freed);
        freed
    }

    fn clone_for_checkpoint(&self, value: &Bytes, attr: PairAttr) -> Option<(Bytes, PairAttr)> {
        self.cloneable.then(|| (value.clone(), attr))
    }

    fn cleaner(&self, req: CleanerRequest<'_, Bytes>) -> Result<Option<PairAttr>, CallbackError> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        req.value.reverse();
        Ok(Some(PairAttr::new(req.value.len())))
    }
}

/// Fetch behaviour that needs values of at least `min_len` bytes
pub struct Complete {
    pub min_len: usize,
}

impl FetchCallbacks<Bytes> for Complete {
    fn fetch(&self, req: FetchRequest<'_>) -> Result<Fetched<Bytes>, CallbackError> {
        let bytes = req.file.read_block(req.key.0)?;
        let attr = PairAttr::new(bytes.len());
        Ok(Fetched::clean(bytes, attr))
    }

    fn partial_fetch_required(&self, value: &Bytes) -> bool {
        value.len() < self.min_len
    }

    fn partial_fetch(&self, req: PartialFetchRequest<'_, Bytes>) -> Result<PairAttr, CallbackError> {
        *req.value = req.file.read_block(req.key.0)?;
        Ok(PairAttr::new(req.value.len()))
    }
}

/// Config with no background threads, so tests drive eviction themselves
pub fn quiet_config(size_limit: usize) -> CachetableConfig {
    CachetableConfig {
        eviction_period_ms: 0,
        writer_threads: 2,
        ..CachetableConfig::with_size_limit(size_limit)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub ct: Cachetable<Bytes>,
    pub blocks: Arc<Blocks>,
    pub file: CacheFile<Bytes>,
}

pub fn setup(size_limit: usize, blocks: Arc<Blocks>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let ct = Cachetable::new(quiet_config(size_limit)).unwrap();
    let file = ct
        .open_file(dir.path().join("data.ft"), OpenFlags::CREATE, blocks.clone())
        .unwrap();
    Fixture { dir, ct, blocks, file }
}

/// Write blocks straight to the backing file (bypassing the cache)
pub fn seed(file: &CacheFile<Bytes>, blocks: impl IntoIterator<Item = (u64, Vec<u8>)>) {
    for (key, bytes) in blocks {
        file.block_file().write_block(key, &bytes).unwrap();
    }
}

pub fn key(block: u64) -> BlockKey {
    BlockKey(block)
}

/// Poll `cond` for up to five seconds
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
