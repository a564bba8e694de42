// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, dead_code)]

use weft_core::{Engine, GraphIndex, GroupFlags, GroupId, Level, MemDevice};

pub const BLOCKSIZE: u32 = 512;
pub const NUMBLOCKS: u32 = 16;

/// Engine plus one level-0 in-memory device with zeroed disk contents.
pub fn engine_and_device() -> (Engine, MemDevice) {
    let mut engine = Engine::new();
    let device = MemDevice::new(
        &mut engine,
        "mem0",
        BLOCKSIZE,
        NUMBLOCKS,
        Level::new(0),
        GraphIndex::new(0),
    )
    .expect("device registration");
    (engine, device)
}

/// A released-then-engaged plain group. While engaged it suppresses
/// non-rollbackable admission, which is the easiest way to get
/// rollback-carrying patches in tests that need them.
pub fn released_engaged_group(engine: &mut Engine) -> GroupId {
    let group = engine
        .group_create(GroupFlags::default())
        .expect("group create");
    engine.group_release(group).expect("group release");
    engine.group_engage(group).expect("group engage");
    group
}

/// An engaged atomic group: members stay gated until release.
pub fn engaged_atomic_group(engine: &mut Engine) -> GroupId {
    let group = engine
        .group_create(GroupFlags {
            atomic: true,
            hidden: false,
        })
        .expect("group create");
    engine.group_engage(group).expect("group engage");
    group
}
