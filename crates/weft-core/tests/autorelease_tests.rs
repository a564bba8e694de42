// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]

mod common;

use common::engine_and_device;
use weft_core::{with_autorelease_pool, BlockDevice, EngineError};

#[test]
fn pool_pop_frees_read_results() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();

    let block = device.read_block(&mut engine, 7).unwrap();
    assert_eq!(engine.bdesc_ref_counts(block).unwrap(), (1, 1));

    engine.autorelease_pool_pop().unwrap();
    assert!(!engine.bdesc_alive(block));

    // Push/pop with nothing in between is a no-op.
    engine.autorelease_pool_push();
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn nested_pools_release_lifo() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let block = device.read_block(&mut engine, 1).unwrap();

    // A second pending release accumulates on the outer pool's entry.
    engine.autorelease_pool_push();
    assert_eq!(engine.autorelease_pool_depth(), 2);
    engine.bdesc_retain(block).unwrap();
    engine.bdesc_autorelease(block).unwrap();
    assert_eq!(engine.bdesc_ref_counts(block).unwrap(), (2, 2));

    // The inner pool never linked the descriptor, so popping it releases
    // nothing.
    engine.autorelease_pool_pop().unwrap();
    assert!(engine.bdesc_alive(block));
    assert_eq!(engine.bdesc_ref_counts(block).unwrap(), (2, 2));

    engine.autorelease_pool_pop().unwrap();
    assert!(!engine.bdesc_alive(block));
    engine.shutdown().unwrap();
}

#[test]
fn autorelease_misuse_is_rejected() {
    let (mut engine, _device) = engine_and_device();

    // No pool pushed.
    let block = engine.bdesc_alloc(0, common::BLOCKSIZE, 1).unwrap();
    assert_eq!(
        engine.bdesc_autorelease(block).unwrap_err(),
        EngineError::InvalidState
    );
    assert_eq!(
        engine.autorelease_pool_pop().unwrap_err(),
        EngineError::InvalidState
    );

    engine.autorelease_pool_push();
    engine.bdesc_autorelease(block).unwrap();
    // ar_count may never exceed ref_count.
    assert_eq!(
        engine.bdesc_autorelease(block).unwrap_err(),
        EngineError::InvalidState
    );
    // And a manual release may not consume a reference a pool owns.
    assert_eq!(
        engine.bdesc_release(block).unwrap_err(),
        EngineError::InvalidState
    );
    engine.autorelease_pool_pop().unwrap();
    assert!(!engine.bdesc_alive(block));
}

#[test]
fn engine_pins_blocks_with_live_patches() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    let block = device.read_block(&mut engine, 2).unwrap();
    let mut head = None;
    engine.create_byte(block, dev, 0, &[3], &mut head).unwrap();

    // The caller's reference goes away, but the live patch keeps the
    // descriptor alive.
    engine.autorelease_pool_pop().unwrap();
    assert!(engine.bdesc_alive(block));
    assert_eq!(engine.bdesc_ref_counts(block).unwrap(), (1, 0));

    // Writing the patch out drops the pin.
    device.write_block(&mut engine, block, 2).unwrap();
    assert!(!engine.bdesc_alive(block));
    assert_eq!(device.disk_block(2)[0], 3);
    engine.shutdown().unwrap();
}

#[test]
fn scoped_pool_helper_pops_on_exit() {
    let (mut engine, mut device) = engine_and_device();
    let block = with_autorelease_pool(&mut engine, |engine| {
        device.read_block(engine, 9)
    })
    .unwrap();
    assert!(!engine.bdesc_alive(block));
    assert_eq!(engine.autorelease_pool_depth(), 0);
    engine.shutdown().unwrap();
}
