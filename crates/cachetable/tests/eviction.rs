//! Clock eviction, partial eviction, budget convergence, write-back failure

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cachetable::{Error, PairAttr, PinMode};
use common::{eventually, key, seed, setup, Blocks};

#[test]
fn test_clock_evicts_least_recently_touched() {
    let fx = setup(20, Blocks::new());
    seed(&fx.file, (0..22).map(|k| (k, vec![k as u8])));

    for block in 0..20 {
        drop(
            fx.ct
                .get_and_pin(&fx.file, key(block), PinMode::Read, fx.blocks.as_ref())
                .unwrap(),
        );
    }
    assert_eq!(fx.ct.size_current(), 20);
    assert_eq!(fx.ct.stats().evictions(), 0);

    // One byte over: the sweep clears every bit, then takes the oldest
    drop(
        fx.ct
            .get_and_pin(&fx.file, key(20), PinMode::Read, fx.blocks.as_ref())
            .unwrap(),
    );
    assert_eq!(fx.ct.size_current(), 20);
    assert_eq!(fx.ct.stats().evictions(), 1);
    assert!(!fx.ct.contains(&fx.file, key(0)));
    assert!(fx.ct.contains(&fx.file, key(1)));

    // A touched pair survives the next sweep; its untouched neighbour does not
    drop(
        fx.ct
            .get_and_pin(&fx.file, key(1), PinMode::Read, fx.blocks.as_ref())
            .unwrap(),
    );
    drop(
        fx.ct
            .get_and_pin(&fx.file, key(21), PinMode::Read, fx.blocks.as_ref())
            .unwrap(),
    );
    assert!(fx.ct.contains(&fx.file, key(1)));
    assert!(!fx.ct.contains(&fx.file, key(2)));
    assert_eq!(fx.ct.size_current(), 20);
    assert_eq!(fx.ct.len(), 20);
}

#[test]
fn test_budget_converges_after_burst() {
    let fx = setup(100, Blocks::new());

    for block in 0..50 {
        fx.ct
            .put(&fx.file, key(block), vec![block as u8; 10], PairAttr::new(10))
            .unwrap()
            .unpin(true, None)
            .unwrap();
    }

    assert!(eventually(|| {
        fx.ct.evict();
        fx.ct.size_current() <= fx.ct.size_limit() && fx.ct.size_evicting() == 0
    }));
    assert!(fx.ct.stats().writebacks() >= 40);

    // Evicted dirty pairs were written back
    let pinned = fx
        .ct
        .get_and_pin(&fx.file, key(0), PinMode::Read, fx.blocks.as_ref())
        .unwrap();
    assert_eq!(pinned.value(), &vec![0u8; 10]);
}

#[test]
fn test_over_budget_with_everything_pinned() {
    let fx = setup(10, Blocks::new());

    let pins: Vec<_> = (0..3)
        .map(|block| {
            fx.ct
                .put(&fx.file, key(block), vec![0; 8], PairAttr::new(8))
                .unwrap()
        })
        .collect();

    assert_eq!(fx.ct.size_current(), 24);
    assert!(fx.ct.stats().over_budget_events() > 0);

    drop(pins);
    assert!(eventually(|| {
        fx.ct.evict();
        fx.ct.size_current() <= 10
    }));
}

#[test]
fn test_partial_eviction_shrinks_instead_of_evicting() {
    let blocks = Arc::new(Blocks {
        shrink_to: Some(1),
        ..Blocks::default()
    });
    let fx = setup(10, blocks);
    seed(&fx.file, [(1, vec![1; 8]), (2, vec![2; 8])]);

    drop(
        fx.ct
            .get_and_pin(&fx.file, key(1), PinMode::Read, fx.blocks.as_ref())
            .unwrap(),
    );
    drop(
        fx.ct
            .get_and_pin(&fx.file, key(2), PinMode::Read, fx.blocks.as_ref())
            .unwrap(),
    );

    assert!(fx.ct.contains(&fx.file, key(1)));
    assert_eq!(fx.ct.pair_info(&fx.file, key(1)).unwrap().attr.size, 1);
    assert_eq!(fx.ct.size_current(), 9);
    assert_eq!(fx.ct.stats().partial_evictions(), 1);
    assert_eq!(fx.ct.stats().evictions(), 0);
}

#[test]
fn test_dirty_pair_written_back_before_eviction() {
    let fx = setup(4, Blocks::new());

    fx.ct
        .put(&fx.file, key(1), b"abcd".to_vec(), PairAttr::new(4))
        .unwrap()
        .unpin(true, None)
        .unwrap();
    fx.ct
        .put(&fx.file, key(2), b"efgh".to_vec(), PairAttr::new(4))
        .unwrap()
        .unpin(true, None)
        .unwrap();

    assert!(eventually(|| !fx.ct.contains(&fx.file, key(1))));
    let flushes = fx.blocks.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].block, 1);
    assert!(!flushes[0].keep_resident);
    assert!(!flushes[0].for_checkpoint);
    assert_eq!(fx.file.block_file().read_block(1).unwrap(), b"abcd");
}

#[test]
fn test_failed_writeback_panics_cachetable() {
    let fx = setup(4, Blocks::new());
    fx.blocks.fail_flush.store(true, Ordering::SeqCst);

    fx.ct
        .put(&fx.file, key(1), b"abcd".to_vec(), PairAttr::new(4))
        .unwrap()
        .unpin(true, None)
        .unwrap();
    let _ = fx
        .ct
        .put(&fx.file, key(2), b"efgh".to_vec(), PairAttr::new(4))
        .map(|pinned| pinned.unpin(true, None));

    assert!(eventually(|| fx.ct.panic_reason().is_some()));
    let err = fx
        .ct
        .get_and_pin(&fx.file, key(1), PinMode::Read, fx.blocks.as_ref())
        .unwrap_err();
    match err {
        Error::Panicked(reason) => assert!(reason.contains("injected flush failure")),
        other => panic!("expected panic, got {other:?}"),
    }
    assert!(matches!(fx.ct.checkpoint(), Err(Error::Panicked(_))));

    // Close discards once panicked
    fx.file.close(false).unwrap();
    fx.ct.close().unwrap();
}
