//! Counter workload
//!
//! Every block holds the sequence of counters written to it: a write pin
//! appends `last + 1`, so a block written `n` times reads back `1..=n`.
//! Readers check the sequence under their pin, and the final on-disk image
//! is checked against the number of writes each block received.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use cachetable::{
    BlockKey, CacheFile, Cachetable, CallbackError, Error, FetchCallbacks, FetchRequest, Fetched,
    FlushRequest, PairAttr, PairCallbacks, PinMode, PinOutcome, StatsSnapshot,
};
use ftdisk::{BlockFile, OpenFlags};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Fixed charge per pair on top of the counters
const PAIR_OVERHEAD: usize = 32;

/// Resident form of a block
pub type Counters = Vec<u64>;

/// Callbacks storing counters as little-endian u64s, one block per pair
pub struct CounterBlocks;

fn attr_for(counters: &Counters) -> PairAttr {
    PairAttr::new(PAIR_OVERHEAD + counters.len() * 8)
}

fn encode(counters: &Counters) -> Vec<u8> {
    counters.iter().flat_map(|c| c.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> std::result::Result<Counters, CallbackError> {
    if bytes.len() % 8 != 0 {
        return Err(CallbackError::from(format!(
            "block length {} is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect())
}

/// Check that `counters` is exactly `1..=counters.len()`
fn check_sequence(key: BlockKey, counters: &Counters) -> Result<()> {
    for (i, counter) in counters.iter().enumerate() {
        ensure!(
            *counter == i as u64 + 1,
            "block {} holds {} at position {}",
            key.0,
            counter,
            i
        );
    }
    Ok(())
}

impl FetchCallbacks<Counters> for CounterBlocks {
    fn fetch(&self, req: FetchRequest<'_>) -> std::result::Result<Fetched<Counters>, CallbackError> {
        let counters = if req.file.contains(req.key.0) {
            decode(&req.file.read_block(req.key.0)?)?
        } else {
            Vec::new()
        };
        let attr = attr_for(&counters);
        Ok(Fetched::clean(counters, attr))
    }
}

impl PairCallbacks<Counters> for CounterBlocks {
    fn flush(&self, req: FlushRequest<'_, Counters>) -> std::result::Result<PairAttr, CallbackError> {
        req.file.write_block(req.key.0, &encode(req.value))?;
        Ok(attr_for(req.value))
    }

    fn clone_for_checkpoint(&self, value: &Counters, attr: PairAttr) -> Option<(Counters, PairAttr)> {
        Some((value.clone(), attr))
    }
}

/// Shape of one run
#[derive(Debug, Clone)]
pub struct Workload {
    /// Client threads
    pub threads: usize,
    /// Operations per thread
    pub ops: u64,
    /// Distinct blocks touched
    pub blocks: u64,
    /// One operation in `write_every` is a write pin
    pub write_every: u32,
    /// Base seed; thread `i` uses `seed + i`
    pub seed: u64,
}

/// What a run did, printed as JSON
#[derive(Debug, Serialize)]
pub struct Report {
    pub threads: usize,
    pub ops: u64,
    pub blocks: u64,
    pub reads: u64,
    pub writes: u64,
    pub busy_retries: u64,
    pub prefetches: u64,
    pub elapsed_ms: u128,
    pub verified_blocks: u64,
    pub stats: StatsSnapshot,
}

#[derive(Default)]
struct Tally {
    busy_retries: AtomicU64,
    prefetches: AtomicU64,
}

/// Drive `workload` against `file`, then checkpoint
///
/// # Returns
/// * Per-block write counts (index = block key) and the run report
pub fn run(
    ct: &Cachetable<Counters>,
    file: &CacheFile<Counters>,
    workload: &Workload,
) -> Result<(Vec<u64>, Report)> {
    let writes: Vec<AtomicU64> = (0..workload.blocks).map(|_| AtomicU64::new(0)).collect();
    let tally = Tally::default();
    let failed = AtomicBool::new(false);
    let fetch: Arc<dyn FetchCallbacks<Counters>> = Arc::new(CounterBlocks);
    let started = Instant::now();

    std::thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..workload.threads)
            .map(|i| {
                let mut rng = fastrand::Rng::with_seed(workload.seed + i as u64);
                let (writes, tally, failed, fetch) = (&writes, &tally, &failed, &fetch);
                s.spawn(move || -> Result<()> {
                    for _ in 0..workload.ops {
                        if failed.load(Ordering::Relaxed) {
                            break;
                        }
                        let key = BlockKey(rng.u64(0..workload.blocks));
                        let result = match rng.u32(0..workload.write_every.max(1) * 4) {
                            0..=3 => write_one(ct, file, key, writes),
                            4 => {
                                tally.prefetches.fetch_add(1, Ordering::Relaxed);
                                ct.prefetch(file, key, Arc::clone(fetch))
                                    .map(drop)
                                    .map_err(Into::into)
                            }
                            5 => read_nonblocking(ct, file, key, fetch, tally),
                            _ => read_one(ct, file, key),
                        };
                        if let Err(err) = result {
                            failed.store(true, Ordering::Relaxed);
                            return Err(err.context(format!("thread {} on block {}", i, key.0)));
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("client thread panicked"),
            }
        }
        Ok(())
    })?;

    let lsn = final_checkpoint(ct)?;
    let writes: Vec<u64> = writes.into_iter().map(AtomicU64::into_inner).collect();
    let total_writes: u64 = writes.iter().sum();
    let prefetches = tally.prefetches.into_inner();
    info!(
        "Workload finished: {} writes, final checkpoint {}",
        total_writes, lsn
    );

    let report = Report {
        threads: workload.threads,
        ops: workload.ops,
        blocks: workload.blocks,
        reads: workload.ops * workload.threads as u64 - total_writes - prefetches,
        writes: total_writes,
        busy_retries: tally.busy_retries.into_inner(),
        prefetches,
        elapsed_ms: started.elapsed().as_millis(),
        verified_blocks: 0,
        stats: ct.stats_snapshot(),
    };
    Ok((writes, report))
}

fn write_one(
    ct: &Cachetable<Counters>,
    file: &CacheFile<Counters>,
    key: BlockKey,
    writes: &[AtomicU64],
) -> Result<()> {
    let mut pinned = ct.get_and_pin(file, key, PinMode::Write, &CounterBlocks)?;
    let counters = pinned
        .value_mut()
        .context("write pin without mutable access")?;
    let next = counters.last().copied().unwrap_or(0) + 1;
    counters.push(next);
    let attr = attr_for(counters);
    writes[key.0 as usize].fetch_add(1, Ordering::Relaxed);
    pinned.unpin(true, Some(attr))?;
    Ok(())
}

fn read_one(ct: &Cachetable<Counters>, file: &CacheFile<Counters>, key: BlockKey) -> Result<()> {
    let pinned = ct.get_and_pin(file, key, PinMode::Read, &CounterBlocks)?;
    check_sequence(key, pinned.value())
}

fn read_nonblocking(
    ct: &Cachetable<Counters>,
    file: &CacheFile<Counters>,
    key: BlockKey,
    fetch: &Arc<dyn FetchCallbacks<Counters>>,
    tally: &Tally,
) -> Result<()> {
    loop {
        match ct.get_and_pin_nonblocking(file, key, PinMode::Read, fetch)? {
            PinOutcome::Pinned(pinned) => return check_sequence(key, pinned.value()),
            PinOutcome::Busy(token) => {
                tally.busy_retries.fetch_add(1, Ordering::Relaxed);
                token.wait();
            }
        }
    }
}

/// Checkpoint once more, waiting out a periodic checkpoint if one runs
fn final_checkpoint(ct: &Cachetable<Counters>) -> Result<u64> {
    loop {
        match ct.checkpoint() {
            Ok(lsn) => return Ok(lsn),
            Err(Error::CheckpointInProgress) => std::thread::sleep(Duration::from_millis(1)),
            Err(err) => return Err(err).context("final checkpoint"),
        }
    }
}

/// Reopen the block file and compare every block with its write count
///
/// # Returns
/// * Number of blocks checked
pub fn verify(path: &Path, writes: &[u64]) -> Result<u64> {
    let file = BlockFile::open(path, OpenFlags::EXISTING)
        .with_context(|| format!("reopening {}", path.display()))?;
    let mut verified = 0;

    for (block, &expected) in writes.iter().enumerate() {
        let key = BlockKey(block as u64);
        let counters = if file.contains(key.0) {
            decode(&file.read_block(key.0)?).map_err(|e| anyhow::anyhow!("block {}: {}", block, e))?
        } else {
            Vec::new()
        };
        check_sequence(key, &counters)?;
        if counters.len() as u64 != expected {
            warn!(
                "Block {} has {} counters, expected {}",
                block,
                counters.len(),
                expected
            );
            bail!(
                "block {} lost writes: {} on disk, {} written",
                block,
                counters.len(),
                expected
            );
        }
        verified += 1;
    }
    debug!("Verified {} blocks of {}", verified, path.display());
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachetable::CachetableConfig;
    use tempfile::TempDir;

    #[test]
    fn test_decode_rejects_torn_block() {
        assert!(decode(&[0u8; 12]).is_err());
        assert_eq!(decode(&encode(&vec![1, 2, 3])).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_check_sequence() {
        assert!(check_sequence(BlockKey(0), &vec![]).is_ok());
        assert!(check_sequence(BlockKey(0), &vec![1, 2, 3]).is_ok());
        assert!(check_sequence(BlockKey(0), &vec![1, 3]).is_err());
    }

    #[test]
    fn test_small_run_verifies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stress.ft");
        let config = CachetableConfig {
            eviction_period_ms: 5,
            checkpoint_period_ms: 10,
            writer_threads: 2,
            // Small enough that the run evicts
            ..CachetableConfig::with_size_limit(2048)
        };
        let ct = Cachetable::new(config).unwrap();
        let file = ct
            .open_file(&path, OpenFlags::CREATE, Arc::new(CounterBlocks))
            .unwrap();
        let workload = Workload {
            threads: 4,
            ops: 500,
            blocks: 32,
            write_every: 2,
            seed: 7,
        };

        let (writes, report) = run(&ct, &file, &workload).unwrap();
        file.close(false).unwrap();
        ct.close().unwrap();

        assert_eq!(report.reads + report.writes + report.prefetches, 2000);
        assert!(report.stats.evictions > 0);
        assert_eq!(verify(&path, &writes).unwrap(), 32);
    }
}
