//! Cachefile lifecycle and the cleaner

mod common;

use std::sync::atomic::Ordering;

use cachetable::{Cachetable, Error, PairAttr, PinMode};
use common::{key, quiet_config, seed, setup, Blocks, Bytes};
use ftdisk::{BlockFile, OpenFlags};
use tempfile::TempDir;

#[test]
fn test_close_writes_back_dirty_pairs() {
    let fx = setup(1 << 20, Blocks::new());
    let path = fx.file.path().to_path_buf();

    for block in 0..4 {
        fx.ct
            .put(&fx.file, key(block), vec![block as u8; 3], PairAttr::new(3))
            .unwrap()
            .unpin(true, None)
            .unwrap();
    }
    fx.file.close(false).unwrap();

    assert!(fx.ct.is_empty());
    assert_eq!(fx.ct.size_current(), 0);
    assert_eq!(fx.blocks.flushes().len(), 4);

    let reopened = BlockFile::open(&path, OpenFlags::EXISTING).unwrap();
    for block in 0..4 {
        assert_eq!(reopened.read_block(block).unwrap(), vec![block as u8; 3]);
    }
    drop(reopened);
    fx.ct.close().unwrap();
}

#[test]
fn test_close_with_discard_skips_writeback() {
    let fx = setup(1 << 20, Blocks::new());

    fx.ct
        .put(&fx.file, key(1), b"lost".to_vec(), PairAttr::new(4))
        .unwrap()
        .unpin(true, None)
        .unwrap();
    fx.file.close(true).unwrap();

    assert!(fx.blocks.flushes().is_empty());
    assert!(fx.ct.is_empty());
    fx.ct.close().unwrap();
}

#[test]
fn test_double_close_is_rejected() {
    let fx = setup(1 << 20, Blocks::new());

    fx.file.close(false).unwrap();
    assert!(fx.file.is_closed());
    assert!(matches!(fx.file.close(false), Err(Error::AlreadyClosed)));
    assert!(matches!(
        fx.ct
            .get_and_pin(&fx.file, key(1), PinMode::Read, fx.blocks.as_ref()),
        Err(Error::FileClosed)
    ));
}

#[test]
fn test_cachetable_close_requires_closed_files() {
    let fx = setup(1 << 20, Blocks::new());

    assert!(matches!(fx.ct.close(), Err(Error::FilesStillOpen(1))));
    fx.file.close(false).unwrap();
    fx.ct.close().unwrap();
    // Closing again is harmless
    fx.ct.close().unwrap();
}

#[test]
fn test_reopen_shares_pairs() {
    let fx = setup(1 << 20, Blocks::new());
    let second = fx
        .ct
        .open_file(fx.file.path(), OpenFlags::EXISTING, fx.blocks.clone())
        .unwrap();
    assert_eq!(second.id(), fx.file.id());

    fx.ct
        .put(&fx.file, key(7), b"shared".to_vec(), PairAttr::new(6))
        .unwrap()
        .unpin(true, None)
        .unwrap();
    assert!(fx.ct.contains(&second, key(7)));

    // The last handle retires the file
    fx.file.close(false).unwrap();
    assert!(fx.ct.contains(&second, key(7)));
    assert!(fx.blocks.flushes().is_empty());

    second.close(false).unwrap();
    assert!(fx.ct.is_empty());
    assert_eq!(fx.blocks.flushes().len(), 1);
}

#[test]
fn test_reopen_after_close_gets_new_id() {
    let dir = TempDir::new().unwrap();
    let ct: Cachetable<Bytes> = Cachetable::new(quiet_config(1 << 20)).unwrap();
    let blocks = Blocks::new();
    let path = dir.path().join("data.ft");

    let first = ct.open_file(&path, OpenFlags::CREATE, blocks.clone()).unwrap();
    let first_id = first.id();
    first.close(false).unwrap();

    let second = ct.open_file(&path, OpenFlags::EXISTING, blocks).unwrap();
    assert_ne!(second.id(), first_id);
    second.close(false).unwrap();
    ct.close().unwrap();
}

#[test]
fn test_dropped_handle_closes_file() {
    let fx = setup(1 << 20, Blocks::new());
    fx.ct
        .put(&fx.file, key(1), b"kept".to_vec(), PairAttr::new(4))
        .unwrap()
        .unpin(true, None)
        .unwrap();

    let common::Fixture { dir: _dir, ct, blocks, file } = fx;
    drop(file);

    assert!(ct.is_empty());
    assert_eq!(blocks.flushes().len(), 1);
    ct.close().unwrap();
}

#[test]
fn test_flush_file_keeps_pairs_resident() {
    let fx = setup(1 << 20, Blocks::new());
    fx.ct
        .put(&fx.file, key(1), b"abc".to_vec(), PairAttr::new(3))
        .unwrap()
        .unpin(true, None)
        .unwrap();

    fx.ct.flush_file(&fx.file).unwrap();

    let info = fx.ct.pair_info(&fx.file, key(1)).unwrap();
    assert!(!info.dirty);
    let flushes = fx.blocks.flushes();
    assert_eq!(flushes.len(), 1);
    assert!(flushes[0].keep_resident);
    assert_eq!(fx.file.block_file().read_block(1).unwrap(), b"abc");
}

#[test]
fn test_cleaner_picks_pressured_pair() {
    let fx = setup(1 << 20, Blocks::new());
    seed(&fx.file, [(1, b"abc".to_vec()), (2, b"xyz".to_vec())]);

    let pinned = fx
        .ct
        .get_and_pin(&fx.file, key(1), PinMode::Write, fx.blocks.as_ref())
        .unwrap();
    pinned
        .unpin(
            false,
            Some(PairAttr {
                size: 3,
                cache_pressure: 5,
            }),
        )
        .unwrap();
    drop(
        fx.ct
            .get_and_pin(&fx.file, key(2), PinMode::Read, fx.blocks.as_ref())
            .unwrap(),
    );

    assert_eq!(fx.ct.run_cleaner(), 1);
    assert_eq!(fx.blocks.cleaned.load(Ordering::SeqCst), 1);
    assert_eq!(fx.ct.stats().cleaner_runs(), 1);

    let info = fx.ct.pair_info(&fx.file, key(1)).unwrap();
    assert!(info.dirty);
    assert_eq!(info.attr.cache_pressure, 0);
    let pinned = fx
        .ct
        .get_and_pin(&fx.file, key(1), PinMode::Read, fx.blocks.as_ref())
        .unwrap();
    assert_eq!(pinned.value(), b"cba");
    drop(pinned);

    // Nothing left under pressure
    assert_eq!(fx.ct.run_cleaner(), 0);
    assert!(!fx.ct.pair_info(&fx.file, key(2)).unwrap().dirty);
}

#[test]
fn test_cleaner_skips_pinned_pairs() {
    let fx = setup(1 << 20, Blocks::new());
    seed(&fx.file, [(1, b"abc".to_vec())]);

    let pinned = fx
        .ct
        .get_and_pin(&fx.file, key(1), PinMode::Write, fx.blocks.as_ref())
        .unwrap();
    pinned
        .unpin(
            false,
            Some(PairAttr {
                size: 3,
                cache_pressure: 1,
            }),
        )
        .unwrap();

    let held = fx
        .ct
        .get_and_pin(&fx.file, key(1), PinMode::Read, fx.blocks.as_ref())
        .unwrap();
    assert_eq!(fx.ct.run_cleaner(), 0);
    drop(held);
    assert_eq!(fx.ct.run_cleaner(), 1);
}
