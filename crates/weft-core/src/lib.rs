// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! weft-core: deterministic write-ordering engine for block storage.
//!
//! File-system modules describe every on-disk mutation as a *patch* — a
//! byte-range write, a 32-bit XOR flip, or an empty synchronization node —
//! annotated with dependencies on other patches. The engine stores the
//! patches, maintains the dependency graph, and prepares *revision slices*
//! so that a block device only ever writes an image consistent with the
//! partial order the dependencies encode. A patch-group layer lets user
//! programs bundle many patches into atomic ordered units without the
//! engine seeing the application's semantics.
//!
//! The engine performs no I/O of its own and persists nothing; block
//! devices implement [`BlockDevice`] and call the revision protocol around
//! their writes. All state lives behind an explicit [`Engine`] handle and
//! the whole crate assumes the single-threaded cooperative discipline
//! described on [`Engine`].
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_lossless,
    clippy::use_self
)]

mod arena;
mod bdesc;
/// Compile-time tunables (level counts, overlap-hash geometry).
pub mod constants;
mod device;
mod engine;
mod graph;
mod group;
mod ident;
mod membd;
mod patch;
mod revision;

// Re-exports for stable public API
/// Engine handle, error kinds, and weak patch references.
pub use engine::{Engine, EngineError, PatchWeak};
/// Strongly typed identifiers for engine-owned objects.
pub use ident::{BdescId, DevId, GraphIndex, GroupId, Level, PatchId};
/// Block-device contract and registration types.
pub use device::{BlockDevice, DeviceInfo, FlushProgress, FlushTarget, SyntheticBlock};
/// In-memory reference block device.
pub use membd::MemDevice;
/// Patch-group flags and forked scopes.
pub use group::{GroupFlags, Scope};
/// Revision-slice summary returned by [`Engine::revision_prepare`].
pub use revision::RevisionSlice;
/// Scoped autorelease-pool helper.
pub use bdesc::with_autorelease_pool;
