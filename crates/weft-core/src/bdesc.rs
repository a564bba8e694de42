// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Block descriptors: cached block bytes, reference counts, patch lists,
//! and the stacked autorelease pool.
//!
//! A bdesc owns one cached block image plus the per-block patch
//! bookkeeping: the creation-ordered `all_patches` list, per-level ready
//! lists, per-graph-index ownership buckets, the overlap hash, the
//! bit-patch map, and the weak slot for the block's non-rollbackable
//! patch. Two reference counters govern the lifetime: `ref_count` strong
//! references and `ar_count` references scheduled for release at the end
//! of the current autorelease pool. `ar_count <= ref_count` always, and
//! the descriptor is freed only when both reach zero.
//!
//! The engine itself holds one strong reference while a block carries any
//! patches, so a descriptor can never be freed out from under live
//! ordering state; that pin is taken when the first patch is created and
//! dropped when the last one is reclaimed.

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::constants::{NBDINDEX, NBDLEVEL, NOVERLAP1};
use crate::engine::{Engine, EngineError};
use crate::ident::{BdescId, PatchId, WeakKey};

/// Per-block state. See the module docs for the lifetime rules.
#[derive(Debug)]
pub(crate) struct BdescNode {
    pub(crate) number: u32,
    pub(crate) length: u32,
    pub(crate) data: Box<[u8]>,
    pub(crate) ref_count: u32,
    pub(crate) ar_count: u32,
    pub(crate) synthetic: bool,
    pub(crate) in_flight: bool,
    /// Every patch targeting this block, in creation order.
    pub(crate) all_patches: Vec<PatchId>,
    /// Per-level lists of this block's ready patches.
    pub(crate) ready_patches: [Vec<PatchId>; NBDLEVEL],
    /// Per-graph-index lists of this block's patches by owning device.
    pub(crate) index_patches: [Vec<PatchId>; NBDINDEX],
    /// Overlap hash: bucket 0 catches ranges crossing a granule boundary,
    /// buckets 1.. hold single-granule byte patches by first granule.
    pub(crate) overlap1: [Vec<PatchId>; NOVERLAP1 + 1],
    /// Latest bit patch per word offset, for flip aggregation.
    pub(crate) bit_patches: FxHashMap<u32, PatchId>,
    /// Weak slot tracking the block's non-rollbackable patch, if any.
    pub(crate) nrb: Option<WeakKey>,
    /// Number of after-edges leaving this block (afters that live on a
    /// different block or on no block at all).
    pub(crate) extern_after_count: u32,
}

impl BdescNode {
    fn new(number: u32, length: u32) -> Self {
        Self {
            number,
            length,
            data: vec![0u8; length as usize].into_boxed_slice(),
            ref_count: 1,
            ar_count: 0,
            synthetic: false,
            in_flight: false,
            all_patches: Vec::new(),
            ready_patches: std::array::from_fn(|_| Vec::new()),
            index_patches: std::array::from_fn(|_| Vec::new()),
            overlap1: std::array::from_fn(|_| Vec::new()),
            bit_patches: FxHashMap::default(),
            nrb: None,
            extern_after_count: 0,
        }
    }
}

impl Engine {
    /// Allocates a fresh, zero-filled block descriptor with `ref_count` 1.
    ///
    /// The actual size is `blocksize * count` bytes.
    ///
    /// # Errors
    /// [`EngineError::InvalidOffset`] when the resulting length is zero.
    pub fn bdesc_alloc(
        &mut self,
        number: u32,
        blocksize: u32,
        count: u32,
    ) -> Result<BdescId, EngineError> {
        let length = blocksize
            .checked_mul(count)
            .ok_or(EngineError::InvalidOffset)?;
        if length == 0 {
            return Err(EngineError::InvalidOffset);
        }
        let id = self.bdescs.insert(BdescNode::new(number, length));
        trace!(block = %id, number, length, "bdesc allocated");
        Ok(id)
    }

    /// Increases the strong reference count.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_retain(&mut self, block: BdescId) -> Result<BdescId, EngineError> {
        let bd = self.bdesc_mut(block)?;
        bd.ref_count += 1;
        Ok(block)
    }

    /// Drops one strong reference, freeing the descriptor when both
    /// counters reach zero.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] if `block` is stale;
    /// - [`EngineError::InvalidState`] when the release would take
    ///   `ref_count` below `ar_count` (a pending autorelease still owns
    ///   the reference).
    pub fn bdesc_release(&mut self, block: BdescId) -> Result<(), EngineError> {
        let bd = self.bdesc_mut(block)?;
        if bd.ref_count == 0 || bd.ref_count <= bd.ar_count {
            return Err(EngineError::InvalidState);
        }
        bd.ref_count -= 1;
        if bd.ref_count == 0 {
            self.bdesc_free(block)?;
        }
        Ok(())
    }

    fn bdesc_free(&mut self, block: BdescId) -> Result<(), EngineError> {
        {
            let bd = self.bdesc(block)?;
            if !bd.all_patches.is_empty() {
                return Err(EngineError::InternalCorruption(
                    "bdesc freed with live patches",
                ));
            }
            if bd.in_flight {
                return Err(EngineError::InternalCorruption("bdesc freed in flight"));
            }
            if bd.extern_after_count != 0 {
                return Err(EngineError::InternalCorruption(
                    "bdesc freed with extern afters",
                ));
            }
        }
        if let Some(nrb) = self.bdesc(block)?.nrb {
            self.weak_release_key(nrb);
        }
        let bd = self.bdescs.remove(block).ok_or(EngineError::NotFound)?;
        trace!(block = %block, number = bd.number, "bdesc freed");
        Ok(())
    }

    /// Schedules the descriptor for release at the end of the current
    /// autorelease pool and returns it, so producers can hand a bdesc back
    /// to a caller without an immediate ownership transfer.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] if `block` is stale;
    /// - [`EngineError::InvalidState`] when no pool is pushed or the
    ///   autorelease count would exceed the reference count.
    pub fn bdesc_autorelease(&mut self, block: BdescId) -> Result<BdescId, EngineError> {
        if self.autorelease_stack.is_empty() {
            return Err(EngineError::InvalidState);
        }
        let bd = self.bdesc_mut(block)?;
        if bd.ar_count == bd.ref_count {
            return Err(EngineError::InvalidState);
        }
        bd.ar_count += 1;
        let first = bd.ar_count == 1;
        if first {
            // Linked into the top pool on the 0 -> 1 transition only; a
            // descriptor already pending in an outer pool just accumulates.
            if let Some(pool) = self.autorelease_stack.last_mut() {
                pool.push(block);
            }
        }
        trace!(block = %block, "bdesc autoreleased");
        Ok(block)
    }

    /// Pushes an autorelease pool onto the stack and returns the new depth.
    pub fn autorelease_pool_push(&mut self) -> usize {
        self.autorelease_stack.push(Vec::new());
        self.autorelease_stack.len()
    }

    /// Pops the top autorelease pool, releasing every pending reference of
    /// each descriptor enqueued since the matching push, then runs the
    /// deferred reclamation pass.
    ///
    /// # Errors
    /// [`EngineError::InvalidState`] when the stack is empty.
    pub fn autorelease_pool_pop(&mut self) -> Result<(), EngineError> {
        let pool = self
            .autorelease_stack
            .pop()
            .ok_or(EngineError::InvalidState)?;
        for block in pool {
            let pending = {
                let bd = self.bdesc_mut(block)?;
                let pending = bd.ar_count;
                bd.ar_count = 0;
                pending
            };
            for _ in 0..pending {
                self.bdesc_release(block)?;
            }
        }
        self.run_reclaim();
        Ok(())
    }

    /// Number of autorelease pools currently on the stack.
    #[must_use]
    pub fn autorelease_pool_depth(&self) -> usize {
        self.autorelease_stack.len()
    }

    // ------------------------------------------------------------------
    // Data access
    // ------------------------------------------------------------------

    /// Returns the block's cached bytes.
    ///
    /// Between [`Engine::revision_prepare`] and the matching acknowledge
    /// or revert, this is the revision-slice image; at all other times it
    /// equals the on-disk image composed with every applied patch.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_data(&self, block: BdescId) -> Result<&[u8], EngineError> {
        Ok(&self.bdesc(block)?.data)
    }

    /// Overwrites the block's cached bytes wholesale and clears the
    /// synthetic bit. Only legal while the block carries no patches
    /// (a read from disk, or a caller filling a synthetic block).
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] if `block` is stale;
    /// - [`EngineError::InvalidOffset`] on a length mismatch;
    /// - [`EngineError::InvalidState`] when patches exist.
    pub fn bdesc_fill(&mut self, block: BdescId, bytes: &[u8]) -> Result<(), EngineError> {
        let bd = self.bdesc_mut(block)?;
        if bytes.len() != bd.length as usize {
            return Err(EngineError::InvalidOffset);
        }
        if !bd.all_patches.is_empty() {
            return Err(EngineError::InvalidState);
        }
        bd.data.copy_from_slice(bytes);
        bd.synthetic = false;
        Ok(())
    }

    /// Marks or clears the synthetic bit (bytes not yet backed by a read).
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_set_synthetic(
        &mut self,
        block: BdescId,
        synthetic: bool,
    ) -> Result<(), EngineError> {
        self.bdesc_mut(block)?.synthetic = synthetic;
        Ok(())
    }

    /// Returns the synthetic bit.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_is_synthetic(&self, block: BdescId) -> Result<bool, EngineError> {
        Ok(self.bdesc(block)?.synthetic)
    }

    /// Returns `true` while the descriptor is live.
    #[must_use]
    pub fn bdesc_alive(&self, block: BdescId) -> bool {
        self.bdescs.contains(block)
    }

    /// Returns `(ref_count, ar_count)` for tests and diagnostics.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_ref_counts(&self, block: BdescId) -> Result<(u32, u32), EngineError> {
        let bd = self.bdesc(block)?;
        Ok((bd.ref_count, bd.ar_count))
    }

    /// Returns the block address the descriptor was allocated for.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_number(&self, block: BdescId) -> Result<u32, EngineError> {
        Ok(self.bdesc(block)?.number)
    }

    /// Returns the descriptor length in bytes.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_length(&self, block: BdescId) -> Result<u32, EngineError> {
        Ok(self.bdesc(block)?.length)
    }

    /// Number of patches currently targeting the block (written ones
    /// included until they are reclaimed).
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn bdesc_patch_count(&self, block: BdescId) -> Result<usize, EngineError> {
        Ok(self.bdesc(block)?.all_patches.len())
    }

    /// Number of unwritten patches currently targeting the block.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn live_patch_count(&self, block: BdescId) -> Result<usize, EngineError> {
        let bd = self.bdesc(block)?;
        let mut live = 0;
        for &pid in &bd.all_patches {
            if let Some(patch) = self.patches.get(pid) {
                if !patch.written {
                    live += 1;
                }
            }
        }
        Ok(live)
    }

    /// Number of ready patches on the block at `dev`'s level.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` or `dev` is stale.
    pub fn ready_patch_count(
        &self,
        block: BdescId,
        dev: crate::DevId,
    ) -> Result<usize, EngineError> {
        let level = self.device(dev)?.info.level;
        Ok(self.bdesc(block)?.ready_patches[level.raw() as usize].len())
    }

    /// Number of patches on the block owned by devices with the given
    /// graph index.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn index_patch_count(
        &self,
        block: BdescId,
        index: crate::GraphIndex,
    ) -> Result<usize, EngineError> {
        Ok(self.bdesc(block)?.index_patches[index.raw() as usize].len())
    }

    // ------------------------------------------------------------------
    // Engine pin (one strong ref per block with live patches)
    // ------------------------------------------------------------------

    pub(crate) fn bdesc_pin(&mut self, block: BdescId) {
        if let Some(bd) = self.bdescs.get_mut(block) {
            bd.ref_count += 1;
        }
    }

    pub(crate) fn bdesc_unpin(&mut self, block: BdescId) {
        let free = match self.bdescs.get_mut(block) {
            Some(bd) => {
                debug_assert!(bd.ref_count > 0);
                bd.ref_count = bd.ref_count.saturating_sub(1);
                bd.ref_count == 0
            }
            None => false,
        };
        if free {
            // Pin was the last reference; invariant failures here indicate
            // an engine bug, so the error is swallowed into a trace only
            // after the debug assertion has had its chance.
            let result = self.bdesc_free(block);
            debug_assert!(result.is_ok());
        }
    }
}

/// Runs `f` inside a fresh autorelease pool, popping it afterwards.
///
/// The scoped rendering of the pool push/pop pair; descriptors
/// autoreleased inside `f` are released when `f` returns.
///
/// # Errors
/// Propagates pool-pop failures after `f` completes.
pub fn with_autorelease_pool<R>(
    engine: &mut Engine,
    f: impl FnOnce(&mut Engine) -> Result<R, EngineError>,
) -> Result<R, EngineError> {
    engine.autorelease_pool_push();
    let result = f(engine);
    let popped = engine.autorelease_pool_pop();
    let value = result?;
    popped?;
    Ok(value)
}
