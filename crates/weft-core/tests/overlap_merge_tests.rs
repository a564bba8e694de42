// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]

mod common;

use common::{engine_and_device, released_engaged_group};
use weft_core::BlockDevice;

#[test]
fn covering_write_data_merges_in_place() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    // Seed known disk contents at offset 4..6.
    let block = device.read_block(&mut engine, 1).unwrap();
    let mut head = None;
    engine
        .create_byte(block, dev, 4, &[0x11, 0x22], &mut head)
        .unwrap();
    device.write_block(&mut engine, block, 1).unwrap();
    assert_eq!(device.disk_block(1)[4..6], [0x11, 0x22]);

    // Suppress non-rollbackable admission so both writes carry rollback.
    let group = released_engaged_group(&mut engine);

    let mut head = None;
    let p1 = engine
        .create_byte(block, dev, 4, &[b'X', b'Y'], &mut head)
        .unwrap();
    let mut head = None;
    let p2 = engine
        .create_byte(block, dev, 4, &[b'Z'], &mut head)
        .unwrap();

    // The second write merged into the first: one patch, composed bytes.
    assert_eq!(p1, p2);
    assert_eq!(engine.bdesc_patch_count(block).unwrap(), 1);
    assert_eq!(engine.bdesc_data(block).unwrap()[4..6], [b'Z', b'Y']);

    // Block the merged patch behind an unwritten anchor and take a slice:
    // the rollback restores the original disk bytes, proving the merge
    // kept the first patch's pre-image.
    let other = device.read_block(&mut engine, 2).unwrap();
    let mut anchor_head = None;
    let anchor = engine
        .create_byte(other, dev, 0, &[1], &mut anchor_head)
        .unwrap();
    engine.add_depend(p1, anchor).unwrap();
    let slice = engine.revision_prepare(block, dev).unwrap();
    assert_eq!(slice.ready, 0);
    assert_eq!(engine.bdesc_data(block).unwrap()[4..6], [0x11, 0x22]);
    engine.revision_revert(block, dev).unwrap();
    assert_eq!(engine.bdesc_data(block).unwrap()[4..6], [b'Z', b'Y']);

    engine.group_disengage(group).unwrap();
    device.write_block(&mut engine, other, 2).unwrap();
    device.write_block(&mut engine, block, 1).unwrap();
    assert_eq!(device.disk_block(1)[4..6], [b'Z', b'Y']);
    engine.group_abandon(group).unwrap();
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn covering_write_absorbs_older_patch_and_rewrites_weak_refs() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    let block_a = device.read_block(&mut engine, 1).unwrap();
    let block_b = device.read_block(&mut engine, 2).unwrap();

    // An unwritten same-level head on another block keeps the new patches
    // rollback-carrying without involving groups.
    let mut head = None;
    let anchor = engine
        .create_byte(block_a, dev, 0, &[1], &mut head)
        .unwrap();

    let mut head = Some(anchor);
    let old = engine
        .create_byte(block_b, dev, 8, &[5, 5], &mut head)
        .unwrap();
    let weak = engine.weak_retain(old).unwrap();

    // A covering write with the same head fully absorbs the older patch.
    let mut head = Some(anchor);
    let survivor = engine
        .create_byte(block_b, dev, 6, &[9, 9, 9, 9, 9, 9], &mut head)
        .unwrap();
    assert_ne!(survivor, old);
    assert!(!engine.patch_alive(old));
    assert_eq!(engine.bdesc_patch_count(block_b).unwrap(), 1);
    assert_eq!(engine.weak_get(&weak), Some(survivor));
    assert!(engine.patch_depends_on(survivor, anchor).unwrap());
    engine.check_invariants().unwrap();

    engine.weak_release(weak);
    device.write_block(&mut engine, block_a, 1).unwrap();
    device.write_block(&mut engine, block_b, 2).unwrap();
    assert_eq!(device.disk_block(2)[6..12], [9, 9, 9, 9, 9, 9]);

    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn bit_flips_on_one_word_aggregate() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();

    let block = device.read_block(&mut engine, 3).unwrap();
    let mut head = None;
    let p1 = engine
        .create_bit(block, dev, 16, 0x0000_00ff, &mut head)
        .unwrap();
    let mut head = None;
    let p2 = engine
        .create_bit(block, dev, 16, 0x0000_ff00, &mut head)
        .unwrap();
    assert_eq!(p1, p2);
    assert_eq!(engine.bdesc_data(block).unwrap()[16..20], [0xff, 0xff, 0, 0]);

    // A flip that cancels the mask keeps the patch alive for ordering.
    let mut head = None;
    let p3 = engine
        .create_bit(block, dev, 16, 0x0000_ffff, &mut head)
        .unwrap();
    assert_eq!(p1, p3);
    assert_eq!(engine.bdesc_data(block).unwrap()[16..20], [0, 0, 0, 0]);
    assert!(engine.patch_alive(p1));

    device.write_block(&mut engine, block, 3).unwrap();
    assert_eq!(device.disk_block(3)[16..20], [0, 0, 0, 0]);

    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn mixed_bit_and_byte_overlaps_order_serially() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();
    let group = released_engaged_group(&mut engine);

    let block = device.read_block(&mut engine, 6).unwrap();
    let mut head = None;
    let byte_patch = engine
        .create_byte(block, dev, 32, &[0x0f; 8], &mut head)
        .unwrap();

    // A bit flip inside the byte range must order after the byte write.
    let mut head = None;
    let bit_patch = engine
        .create_bit(block, dev, 36, 0xffff_ffff, &mut head)
        .unwrap();
    assert_ne!(byte_patch, bit_patch);
    assert!(engine.patch_depends_on(bit_patch, byte_patch).unwrap());
    assert_eq!(
        engine.bdesc_data(block).unwrap()[36..40],
        [0xf0, 0xf0, 0xf0, 0xf0]
    );

    // And a byte write over the flipped word orders after the flip.
    let mut head = None;
    let byte_two = engine
        .create_byte(block, dev, 36, &[0xaa, 0xbb], &mut head)
        .unwrap();
    assert!(engine.patch_depends_on(byte_two, bit_patch).unwrap());
    engine.check_invariants().unwrap();

    engine.group_disengage(group).unwrap();
    device.write_block(&mut engine, block, 6).unwrap();
    assert_eq!(device.disk_block(6)[36..40], [0xaa, 0xbb, 0xf0, 0xf0]);
    assert_eq!(device.disk_block(6)[32..36], [0x0f, 0x0f, 0x0f, 0x0f]);

    engine.group_abandon(group).unwrap();
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}
