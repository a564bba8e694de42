// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]

mod common;

use common::engine_and_device;
use weft_core::{BlockDevice, EngineError, FlushProgress, FlushTarget};

#[test]
fn single_write_reaches_disk_and_reclaims() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();

    let block = device.read_block(&mut engine, 10).unwrap();
    let mut head = None;
    let patch = engine
        .create_byte(block, device.dev_id(), 0, &[1, 2, 3, 4], &mut head)
        .unwrap();
    assert_eq!(head, Some(patch));
    assert_eq!(engine.bdesc_data(block).unwrap()[..4], [1, 2, 3, 4]);

    device.write_block(&mut engine, block, 10).unwrap();
    assert_eq!(device.disk_block(10)[..6], [1, 2, 3, 4, 0, 0]);
    assert!(!engine.patch_alive(patch));
    assert_eq!(engine.bdesc_patch_count(block).unwrap(), 0);

    engine.autorelease_pool_pop().unwrap();
    assert!(!engine.bdesc_alive(block));
    engine.check_invariants().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn ordered_pair_rolls_back_dependent_block() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    let block1 = device.read_block(&mut engine, 1).unwrap();
    let block2 = device.read_block(&mut engine, 2).unwrap();
    let mut head = None;
    let p1 = engine
        .create_byte(block1, dev, 0, &[0xAA], &mut head)
        .unwrap();
    let p2 = engine
        .create_byte(block2, dev, 0, &[0xBB], &mut head)
        .unwrap();
    assert!(engine.patch_depends_on(p2, p1).unwrap());

    // The device schedules block 2 first: its patch must be rolled back,
    // so the pre-image (zeros) is what reaches the disk.
    device.write_block(&mut engine, block2, 2).unwrap();
    assert_eq!(device.disk_block(2)[0], 0);
    assert!(!engine.patch_written(p2).unwrap());
    // The in-memory image is restored after the write.
    assert_eq!(engine.bdesc_data(block2).unwrap()[0], 0xBB);

    device.write_block(&mut engine, block1, 1).unwrap();
    assert_eq!(device.disk_block(1)[0], 0xAA);
    assert!(!engine.patch_alive(p1));

    device.write_block(&mut engine, block2, 2).unwrap();
    assert_eq!(device.disk_block(2)[0], 0xBB);
    assert!(!engine.patch_alive(p2));

    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn failed_write_reverts_and_allows_retry() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    let block = device.read_block(&mut engine, 3).unwrap();
    let mut head = None;
    let patch = engine
        .create_byte(block, dev, 8, &[7, 7, 7], &mut head)
        .unwrap();

    device.fail_next_writes(1);
    let err = device.write_block(&mut engine, block, 3).unwrap_err();
    assert_eq!(err, EngineError::IoFailed);
    // Nothing marked written, image intact, patch still eligible.
    assert!(!engine.patch_written(patch).unwrap());
    assert_eq!(engine.bdesc_data(block).unwrap()[8..11], [7, 7, 7]);
    assert_eq!(device.disk_block(3)[8], 0);
    engine.check_invariants().unwrap();

    device.write_block(&mut engine, block, 3).unwrap();
    assert_eq!(device.disk_block(3)[8..11], [7, 7, 7]);
    assert!(!engine.patch_alive(patch));

    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn flush_reports_empty_progress_and_stalled() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    assert_eq!(
        device.flush(&mut engine, FlushTarget::All).unwrap(),
        FlushProgress::Empty
    );

    let block1 = device.read_block(&mut engine, 1).unwrap();
    let block2 = device.read_block(&mut engine, 2).unwrap();
    let mut head = None;
    engine.create_byte(block1, dev, 0, &[1], &mut head).unwrap();
    engine.create_byte(block2, dev, 0, &[2], &mut head).unwrap();

    // Schedule block 2 only; its patch is blocked behind block 1's, so
    // the write lands the pre-image and a flush round cannot progress.
    device.write_block(&mut engine, block2, 2).unwrap();
    assert_eq!(device.disk_block(2)[0], 0);
    assert_eq!(
        device.flush(&mut engine, FlushTarget::All).unwrap(),
        FlushProgress::Stalled
    );

    // Scheduling block 1 unblocks everything.
    device.write_block(&mut engine, block1, 1).unwrap();
    assert_eq!(
        device.flush(&mut engine, FlushTarget::All).unwrap(),
        FlushProgress::Progress
    );
    assert_eq!(
        device.flush(&mut engine, FlushTarget::All).unwrap(),
        FlushProgress::Empty
    );
    assert_eq!(device.disk_block(2)[0], 2);

    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn synthetic_read_is_fillable_without_disk_read() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();

    let synth = device.synthetic_read_block(&mut engine, 5).unwrap();
    assert!(synth.synthetic);
    engine
        .bdesc_fill(synth.block, &[9u8; common::BLOCKSIZE as usize])
        .unwrap();
    assert!(!engine.bdesc_is_synthetic(synth.block).unwrap());

    // A later synthetic read of the same block sees the cached, now
    // backed descriptor.
    let again = device.synthetic_read_block(&mut engine, 5).unwrap();
    assert_eq!(again.block, synth.block);
    assert!(!again.synthetic);

    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn revision_prepare_refuses_reentry() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    let block = device.read_block(&mut engine, 4).unwrap();
    let mut head = None;
    engine.create_byte(block, dev, 0, &[1], &mut head).unwrap();

    let slice = engine.revision_prepare(block, dev).unwrap();
    assert_eq!(slice.ready, 1);
    assert_eq!(
        engine.revision_prepare(block, dev).unwrap_err(),
        EngineError::Busy
    );
    // Creating on an in-flight block is refused too.
    let mut head2 = None;
    assert_eq!(
        engine
            .create_byte(block, dev, 4, &[2], &mut head2)
            .unwrap_err(),
        EngineError::Busy
    );
    engine.revision_revert(block, dev).unwrap();

    device.write_block(&mut engine, block, 4).unwrap();
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}
