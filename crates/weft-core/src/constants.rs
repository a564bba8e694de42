// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Compile-time tunables.
//!
//! These are deliberate constants rather than runtime configuration: block
//! descriptors embed fixed-size per-level and per-index tables, and keeping
//! the bounds compile-time keeps those tables allocation-free.

/// Maximum number of block-device levels in a stack.
///
/// Level 0 is nearest the application; higher levels are nearer the disk.
/// At most one registered device may sit at each level of a given stack.
pub const NBDLEVEL: usize = 8;

/// Maximum number of graph indices.
///
/// A graph index is an ownership ordinal, unrelated to levels, used to
/// bucket the patches on a block by owning device. Always at least
/// [`NBDLEVEL`].
pub const NBDINDEX: usize = 16;

/// Number of first-changed-granule buckets in the per-block overlap hash.
pub const NOVERLAP1: usize = 32;

/// Log2 of the overlap-hash granule size in bytes.
///
/// A byte patch whose range stays inside one `1 << OVERLAP1SHIFT`-byte
/// granule hashes to that granule's bucket; ranges crossing a granule
/// boundary fall into the catch-all bucket 0.
pub const OVERLAP1SHIFT: u32 = 5;

/// Autorelease pool slots reserved up front.
///
/// One top-level pool plus one nested pool covers the common case; deeper
/// stacks grow the backing vector.
pub const STATIC_AUTO_POOLS: usize = 2;
