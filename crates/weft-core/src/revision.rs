// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Revision slices: the write-path protocol.
//!
//! A block device about to write block `b` asks the engine to prepare a
//! *revision slice* at the device's level: the engine rolls the block's
//! cached image back through every patch that is not both owned at that
//! level and ready, leaving exactly "on-disk image + ready patches". The
//! device writes the image, then either acknowledges (the rolled-back
//! patches are re-applied and the ready ones marked written) or reverts
//! (the image is restored and nothing is marked, leaving the patches
//! eligible for a retry).
//!
//! Rollback walks the block's patches in reverse creation order and
//! re-application walks forward, so overlapping effects compose exactly.
//! The `ROLLBACK` state is observable only between prepare and the
//! matching acknowledge or revert; the single-threaded discipline keeps
//! every other operation outside that window, and creation on an
//! in-flight block is refused with `Busy`.

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};
use crate::ident::{BdescId, DevId, PatchId};
use crate::patch::PatchKind;

/// Summary of a prepared revision slice.
#[derive(Debug, Clone, Copy)]
pub struct RevisionSlice {
    /// The block the slice was taken on.
    pub block: BdescId,
    /// The device the slice was taken for.
    pub dev: DevId,
    /// Patches left applied and marked in flight (ready at the device's
    /// level). Zero means the image is the pure pre-dependency state and
    /// writing it makes no ordering progress.
    pub ready: usize,
    /// Patches rolled back for the duration of the slice.
    pub rolled_back: usize,
}

impl Engine {
    /// Prepares the revision slice of `block` for `dev`.
    ///
    /// On success the block is marked in flight and its cached bytes are
    /// the slice image; every other engine operation on the block is
    /// refused until [`Engine::revision_acknowledge`] or
    /// [`Engine::revision_revert`] ends the window.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for stale ids;
    /// - [`EngineError::Busy`] when the block is already in flight;
    /// - [`EngineError::InternalCorruption`] if a non-rollbackable patch
    ///   would need rolling back (admission gating makes this a bug).
    pub fn revision_prepare(
        &mut self,
        block: BdescId,
        dev: DevId,
    ) -> Result<RevisionSlice, EngineError> {
        let level = self.device(dev)?.info.level;
        {
            let bd = self.bdesc(block)?;
            if bd.in_flight {
                return Err(EngineError::Busy);
            }
        }
        let ids: Vec<PatchId> = self.bdesc(block)?.all_patches.clone();
        let mut ready = 0usize;
        let mut rolled_back = 0usize;
        for &pid in ids.iter().rev() {
            let (written, is_ready, nrb) = {
                let p = self.patch(pid)?;
                (
                    p.written,
                    p.level == level && p.blocking_befores == 0,
                    p.is_nonrollbackable(),
                )
            };
            if written {
                continue;
            }
            if is_ready {
                continue;
            }
            if nrb {
                return Err(EngineError::InternalCorruption(
                    "non-rollbackable patch blocked at slice time",
                ));
            }
            self.roll_back_patch(block, pid)?;
            rolled_back += 1;
        }
        for &pid in &ids {
            let p = self.patch_mut(pid)?;
            if !p.written && !p.rolled_back && p.level == level && p.blocking_befores == 0 {
                p.in_flight = true;
                ready += 1;
            }
        }
        self.bdesc_mut(block)?.in_flight = true;
        debug!(%block, %dev, ready, rolled_back, "revision slice prepared");
        Ok(RevisionSlice {
            block,
            dev,
            ready,
            rolled_back,
        })
    }

    /// Acknowledges a successful device write of the prepared slice:
    /// re-applies the rolled-back patches, marks the in-flight ready
    /// patches written, propagates readiness to their afters, and runs
    /// the deferred reclamation pass.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for stale ids;
    /// - [`EngineError::InvalidState`] when no slice is outstanding.
    pub fn revision_acknowledge(&mut self, block: BdescId, dev: DevId) -> Result<(), EngineError> {
        self.device(dev)?;
        if !self.bdesc(block)?.in_flight {
            return Err(EngineError::InvalidState);
        }
        let ids: Vec<PatchId> = self.bdesc(block)?.all_patches.clone();
        for &pid in &ids {
            if self.patch(pid)?.rolled_back {
                self.roll_forward_patch(block, pid)?;
            }
        }
        for &pid in &ids {
            if self.patch(pid)?.in_flight {
                self.satisfy_patch(pid);
            }
        }
        self.bdesc_mut(block)?.in_flight = false;
        self.run_reclaim();
        debug!(%block, %dev, "revision slice acknowledged");
        Ok(())
    }

    /// Restores the block after a failed device write: re-applies the
    /// rolled-back patches and clears in-flight marks without writing
    /// anything. The affected patches remain eligible for a retry.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for stale ids;
    /// - [`EngineError::InvalidState`] when no slice is outstanding.
    pub fn revision_revert(&mut self, block: BdescId, dev: DevId) -> Result<(), EngineError> {
        self.device(dev)?;
        if !self.bdesc(block)?.in_flight {
            return Err(EngineError::InvalidState);
        }
        let ids: Vec<PatchId> = self.bdesc(block)?.all_patches.clone();
        for &pid in &ids {
            if self.patch(pid)?.rolled_back {
                self.roll_forward_patch(block, pid)?;
            }
        }
        for &pid in &ids {
            let p = self.patch_mut(pid)?;
            p.in_flight = false;
        }
        self.bdesc_mut(block)?.in_flight = false;
        warn!(%block, %dev, "revision slice reverted after write failure");
        Ok(())
    }

    /// Un-applies one patch from the cached image. Byte patches swap the
    /// stored pre-image into the buffer (the buffer's new bytes land in
    /// the swap buffer for re-application); bit patches XOR their mask.
    fn roll_back_patch(&mut self, block: BdescId, patch: PatchId) -> Result<(), EngineError> {
        self.swap_patch_bytes(block, patch)?;
        let p = self.patch_mut(patch)?;
        debug_assert!(!p.rolled_back);
        p.rolled_back = true;
        Ok(())
    }

    fn roll_forward_patch(&mut self, block: BdescId, patch: PatchId) -> Result<(), EngineError> {
        self.swap_patch_bytes(block, patch)?;
        let p = self.patch_mut(patch)?;
        debug_assert!(p.rolled_back);
        p.rolled_back = false;
        Ok(())
    }

    fn swap_patch_bytes(&mut self, block: BdescId, patch: PatchId) -> Result<(), EngineError> {
        let node = self.patches.get_mut(patch).ok_or(EngineError::NotFound)?;
        let bd = self.bdescs.get_mut(block).ok_or(EngineError::NotFound)?;
        match &mut node.kind {
            PatchKind::Byte {
                offset,
                stored: Some(stored),
                ..
            } => {
                let at = *offset as usize;
                for (held, live) in stored.iter_mut().zip(&mut bd.data[at..]) {
                    std::mem::swap(held, live);
                }
                Ok(())
            }
            PatchKind::Byte { stored: None, .. } => Err(EngineError::InternalCorruption(
                "non-rollbackable patch has no swap buffer",
            )),
            PatchKind::Bit { offset, xor } => {
                let at = *offset as usize;
                for (byte, mask) in bd.data[at..at + 4].iter_mut().zip(xor.to_le_bytes()) {
                    *byte ^= mask;
                }
                Ok(())
            }
            PatchKind::Empty => Err(EngineError::InternalCorruption(
                "empty patch on a block list",
            )),
        }
    }
}
