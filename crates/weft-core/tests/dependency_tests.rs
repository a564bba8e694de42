// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]

mod common;

use common::{engine_and_device, released_engaged_group};
use weft_core::{BlockDevice, EngineError, PatchId};

/// Three rollback-carrying patches on three blocks, no mutual edges.
fn three_patches(
    engine: &mut weft_core::Engine,
    device: &mut weft_core::MemDevice,
) -> (PatchId, PatchId, PatchId) {
    let dev = device.dev_id();
    let mut out = Vec::new();
    for number in 1..=3 {
        let block = device.read_block(engine, number).unwrap();
        let mut head = None;
        out.push(
            engine
                .create_byte(block, dev, 0, &[number as u8], &mut head)
                .unwrap(),
        );
    }
    (out[0], out[1], out[2])
}

#[test]
fn cycle_is_rejected_and_graph_unchanged() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let group = released_engaged_group(&mut engine);
    let (a, b, c) = three_patches(&mut engine, &mut device);

    engine.add_depend(a, b).unwrap();
    engine.add_depend(b, c).unwrap();
    assert_eq!(engine.add_depend(c, a).unwrap_err(), EngineError::Cycle);
    assert!(!engine.patch_depends_on(c, a).unwrap());
    assert!(engine.patch_depends_on(a, c).unwrap());
    engine.check_invariants().unwrap();

    engine.group_disengage(group).unwrap();
    engine.group_abandon(group).unwrap();
    for number in [3u32, 2, 1] {
        let block = device.read_block(&mut engine, number).unwrap();
        device.write_block(&mut engine, block, number).unwrap();
    }
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn self_dependency_is_a_cycle() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let group = released_engaged_group(&mut engine);
    let (a, _, _) = three_patches(&mut engine, &mut device);
    assert_eq!(engine.add_depend(a, a).unwrap_err(), EngineError::Cycle);

    engine.group_disengage(group).unwrap();
    engine.group_abandon(group).unwrap();
    for number in 1..=3 {
        let block = device.read_block(&mut engine, number).unwrap();
        device.write_block(&mut engine, block, number).unwrap();
    }
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn implied_edges_are_noops_and_subsumed_edges_are_dropped() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let group = released_engaged_group(&mut engine);
    let (a, b, c) = three_patches(&mut engine, &mut device);

    engine.add_depend(b, c).unwrap();
    engine.add_depend(a, c).unwrap();
    // a -> b subsumes the direct a -> c edge; removing the direct edge
    // afterwards reports it as already gone.
    engine.add_depend(a, b).unwrap();
    assert!(engine.patch_depends_on(a, c).unwrap());
    assert_eq!(
        engine.remove_depend(a, c).unwrap_err(),
        EngineError::NotFound
    );
    // Re-adding the transitively implied edge is a no-op.
    engine.add_depend(a, c).unwrap();
    assert_eq!(
        engine.remove_depend(a, c).unwrap_err(),
        EngineError::NotFound
    );
    engine.check_invariants().unwrap();

    engine.group_disengage(group).unwrap();
    engine.group_abandon(group).unwrap();
    for number in [3u32, 2, 1] {
        let block = device.read_block(&mut engine, number).unwrap();
        device.write_block(&mut engine, block, number).unwrap();
    }
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn remove_depend_restores_readiness() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();
    let group = released_engaged_group(&mut engine);
    let (a, b, _) = three_patches(&mut engine, &mut device);

    engine.add_depend(a, b).unwrap();
    let block1 = device.read_block(&mut engine, 1).unwrap();
    // Patch a is blocked, so a slice of its block carries nothing.
    let slice = engine.revision_prepare(block1, dev).unwrap();
    assert_eq!(slice.ready, 0);
    engine.revision_revert(block1, dev).unwrap();

    engine.remove_depend(a, b).unwrap();
    let slice = engine.revision_prepare(block1, dev).unwrap();
    assert_eq!(slice.ready, 1);
    engine.revision_revert(block1, dev).unwrap();
    engine.check_invariants().unwrap();

    engine.group_disengage(group).unwrap();
    engine.group_abandon(group).unwrap();
    for number in 1..=3 {
        let block = device.read_block(&mut engine, number).unwrap();
        device.write_block(&mut engine, block, number).unwrap();
    }
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn empty_patches_join_and_collapse() {
    let (mut engine, mut device) = engine_and_device();
    engine.autorelease_pool_push();
    let dev = device.dev_id();
    let group = released_engaged_group(&mut engine);
    let (a, b, _) = three_patches(&mut engine, &mut device);
    engine.group_disengage(group).unwrap();

    // A join over two live patches stays unwritten until both are.
    let join = engine.create_empty_array(Some(dev), &[a, b]).unwrap();
    assert!(!engine.patch_written(join).unwrap());

    // Chaining an empty onto an empty head reuses the head.
    let mut head = Some(join);
    let again = engine.create_empty(Some(dev), &mut head).unwrap();
    assert_eq!(again, join);

    // An unconstrained empty is vacuously satisfied.
    let mut free_head = None;
    let free = engine.create_empty(Some(dev), &mut free_head).unwrap();
    assert!(engine.patch_written(free).unwrap());

    engine.group_abandon(group).unwrap();
    for number in 1..=3 {
        let block = device.read_block(&mut engine, number).unwrap();
        device.write_block(&mut engine, block, number).unwrap();
    }
    assert!(!engine.patch_alive(join));
    engine.autorelease_pool_pop().unwrap();
    engine.shutdown().unwrap();
}
