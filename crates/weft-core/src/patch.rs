// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Patches: the core ordered-modification primitive.
//!
//! A patch records one modification to one block: a byte-range write
//! carrying swap-buffer rollback bytes, a 32-bit XOR flip, or an empty
//! synchronization node with no data at all. Creation threads a *write
//! head* through the call: a `&mut Option<PatchId>` that names the patch
//! the new work must follow on entry and a patch from which the new work
//! is reachable on return. `None` means "no sequencing constraint from
//! prior work", not "fresh root".
//!
//! Byte patches use swap semantics for rollback: while the patch is
//! applied, `stored` holds the pre-image; while rolled back, the new
//! bytes. Rolling back is therefore a range swap and the round-trip is
//! exact by construction. Bit patches are their own inverse. The XOR mask
//! of a bit patch is applied to the word's bytes little-endian.
//!
//! Overlapping writes are ordered by in-block serial attachment (a new
//! patch depends on every live patch it overlaps) and are merged away
//! entirely where the dependency structure permits, so hot blocks do not
//! accumulate unbounded patch chains.

use tracing::trace;

use crate::constants::{NOVERLAP1, OVERLAP1SHIFT};
use crate::engine::{Engine, EngineError};
use crate::ident::{BdescId, DevId, GraphIndex, Level, PatchId, WeakKey};

/// Discriminates the three patch kinds and carries their payload.
#[derive(Debug)]
pub(crate) enum PatchKind {
    /// Byte-range write. `stored` is the swap buffer; `None` marks the
    /// block's non-rollbackable patch.
    Byte {
        offset: u32,
        len: u32,
        stored: Option<Box<[u8]>>,
    },
    /// 32-bit XOR flip at a word-aligned offset.
    Bit { offset: u32, xor: u32 },
    /// No data; a pure graph node used as a synchronization join.
    Empty,
}

/// One patch. Lifetime: created, possibly merged away, ready when its
/// last lower-or-equal-level before is satisfied, written on
/// acknowledgement, reclaimed once nothing depends on it.
#[derive(Debug)]
pub(crate) struct PatchNode {
    pub(crate) kind: PatchKind,
    pub(crate) target: Option<BdescId>,
    pub(crate) owner: Option<DevId>,
    pub(crate) level: Level,
    pub(crate) graph_index: Option<GraphIndex>,
    pub(crate) befores: Vec<PatchId>,
    pub(crate) afters: Vec<PatchId>,
    /// Unwritten befores at a lower-or-equal level; zero means ready.
    pub(crate) blocking_befores: u32,
    pub(crate) written: bool,
    pub(crate) rolled_back: bool,
    pub(crate) in_flight: bool,
    /// Blocks empty-patch auto-satisfaction (patch-group gating).
    pub(crate) held: bool,
    /// Blocks reclamation (patch-group endpoints).
    pub(crate) pinned: bool,
    pub(crate) queued_free: bool,
    pub(crate) in_ready_list: bool,
    pub(crate) overlap_bucket: Option<usize>,
    pub(crate) weak_slots: Vec<WeakKey>,
}

impl PatchNode {
    fn new(kind: PatchKind, target: Option<BdescId>, owner: Option<DevId>, level: Level) -> Self {
        Self {
            kind,
            target,
            owner,
            level,
            graph_index: None,
            befores: Vec::new(),
            afters: Vec::new(),
            blocking_befores: 0,
            written: false,
            rolled_back: false,
            in_flight: false,
            held: false,
            pinned: false,
            queued_free: false,
            in_ready_list: false,
            overlap_bucket: None,
            weak_slots: Vec::new(),
        }
    }

    pub(crate) fn is_empty_kind(&self) -> bool {
        matches!(self.kind, PatchKind::Empty)
    }

    pub(crate) fn is_nonrollbackable(&self) -> bool {
        matches!(self.kind, PatchKind::Byte { stored: None, .. })
    }

    fn byte_range(&self) -> Option<(u32, u32)> {
        match self.kind {
            PatchKind::Byte { offset, len, .. } => Some((offset, len)),
            _ => None,
        }
    }
}

/// Overlap-hash bucket for a byte range: single-granule ranges hash by
/// first granule, everything else lands in the catch-all bucket 0.
fn overlap1_bucket(offset: u32, len: u32) -> usize {
    let first = offset >> OVERLAP1SHIFT;
    let last = (offset + len - 1) >> OVERLAP1SHIFT;
    if first == last {
        1 + (first as usize & (NOVERLAP1 - 1))
    } else {
        0
    }
}

fn ranges_overlap(a_off: u32, a_len: u32, b_off: u32, b_len: u32) -> bool {
    a_off < b_off + b_len && b_off < a_off + a_len
}

impl Engine {
    // ------------------------------------------------------------------
    // Byte patches
    // ------------------------------------------------------------------

    /// Records a byte-range write of `bytes` at `offset` on `block`, owned
    /// by `dev`, sequenced after `*head`.
    ///
    /// The new bytes are applied to the block's cached image immediately;
    /// the pre-image is captured as rollback data unless the write is
    /// admitted as the block's non-rollbackable patch. Where an existing
    /// patch already covers the range and the dependency structure
    /// permits, the write merges into it instead of allocating ("data
    /// merging") and the existing patch is returned. On return `*head`
    /// names the patch carrying this write.
    ///
    /// # Errors
    /// - [`EngineError::InvalidOffset`] for an empty or out-of-bounds
    ///   range;
    /// - [`EngineError::Busy`] while the block is in flight;
    /// - [`EngineError::NotFound`] for stale ids;
    /// - [`EngineError::Cycle`] when sequencing after `*head` would close
    ///   a dependency cycle through an engaged patch group.
    pub fn create_byte(
        &mut self,
        block: BdescId,
        dev: DevId,
        offset: u32,
        bytes: &[u8],
        head: &mut Option<PatchId>,
    ) -> Result<PatchId, EngineError> {
        let len = bytes.len() as u32;
        if len == 0 {
            return Err(EngineError::InvalidOffset);
        }
        let (level, gindex) = {
            let dev = self.device(dev)?;
            (dev.info.level, dev.info.graph_index)
        };
        {
            let bd = self.bdesc(block)?;
            let end = offset.checked_add(len).ok_or(EngineError::InvalidOffset)?;
            if end > bd.length {
                return Err(EngineError::InvalidOffset);
            }
            if bd.in_flight {
                return Err(EngineError::Busy);
            }
        }
        if let Some(h) = *head {
            self.patch(h)?;
        }
        let engaged = self.engaged_nodes();
        let overlaps = self.collect_overlaps(block, offset, len);

        // Merge into the block's non-rollbackable patch when sequencing
        // permits: every byte write on an NRB block folds into it. The
        // merged bytes take the NRB's place in the block's serial order,
        // so no later overlapping patch may exist.
        if let Some(nrb) = self.block_nrb(block) {
            if overlaps.iter().all(|&o| o == nrb)
                && self.merge_admissible(nrb, *head, &engaged)
            {
                self.apply_new_bytes(block, offset, bytes)?;
                self.attach_group_afters(nrb, &engaged)?;
                *head = Some(nrb);
                trace!(patch = %nrb, offset, len, "byte write merged into nrb");
                return Ok(nrb);
            }
        }

        // Data merge: an existing byte patch covering the range absorbs
        // the write in place. Same serial-order restriction: everything
        // else overlapping the range must already order before the
        // candidate.
        if let Some(existing) =
            self.find_covering_patch(block, dev, offset, len, *head, &engaged, &overlaps)
        {
            self.apply_new_bytes(block, offset, bytes)?;
            self.attach_group_afters(existing, &engaged)?;
            *head = Some(existing);
            trace!(patch = %existing, offset, len, "byte write data-merged");
            return Ok(existing);
        }

        // Fresh patch; every failure path up to here leaves the engine
        // untouched.
        self.precheck_group_cycles(*head, &overlaps, &engaged)?;

        let nrb = self.nrb_admissible(block, level, *head, &engaged)?;
        let stored = if nrb {
            None
        } else {
            let bd = self.bdesc(block)?;
            Some(
                bd.data[offset as usize..(offset + len) as usize]
                    .to_vec()
                    .into_boxed_slice(),
            )
        };
        self.apply_new_bytes(block, offset, bytes)?;

        let mut node = PatchNode::new(
            PatchKind::Byte {
                offset,
                len,
                stored,
            },
            Some(block),
            Some(dev),
            level,
        );
        node.graph_index = Some(gindex);
        let pid = self.patches.insert(node);
        self.register_on_block(pid, block, gindex)?;
        if nrb {
            let key = self.weak_retain_key(pid)?;
            self.bdesc_mut(block)?.nrb = Some(key);
        } else {
            let bucket = overlap1_bucket(offset, len);
            self.bdesc_mut(block)?.overlap1[bucket].push(pid);
            if let Some(p) = self.patches.get_mut(pid) {
                p.overlap_bucket = Some(bucket);
            }
        }
        self.ready_list_insert(pid);

        if let Some(h) = *head {
            self.add_depend(pid, h)?;
        }
        for &o in &overlaps {
            self.add_depend(pid, o)?;
        }
        self.attach_groups(pid, &engaged)?;
        self.absorb_covered(pid, block, dev, offset, len, &overlaps);

        *head = Some(pid);
        trace!(patch = %pid, %block, offset, len, nrb, "byte patch created");
        Ok(pid)
    }

    // ------------------------------------------------------------------
    // Bit patches
    // ------------------------------------------------------------------

    /// Records a 32-bit XOR flip at word-aligned `offset` on `block`.
    ///
    /// Independent flips of the same word aggregate into one patch with a
    /// combined mask when sequencing permits; a mask that collapses to
    /// zero keeps the patch, since its ordering obligations remain.
    ///
    /// # Errors
    /// As [`Engine::create_byte`], plus [`EngineError::InvalidOffset`]
    /// for an unaligned offset.
    pub fn create_bit(
        &mut self,
        block: BdescId,
        dev: DevId,
        offset: u32,
        xor: u32,
        head: &mut Option<PatchId>,
    ) -> Result<PatchId, EngineError> {
        if offset % 4 != 0 {
            return Err(EngineError::InvalidOffset);
        }
        let (level, gindex) = {
            let dev = self.device(dev)?;
            (dev.info.level, dev.info.graph_index)
        };
        {
            let bd = self.bdesc(block)?;
            let end = offset.checked_add(4).ok_or(EngineError::InvalidOffset)?;
            if end > bd.length {
                return Err(EngineError::InvalidOffset);
            }
            if bd.in_flight {
                return Err(EngineError::Busy);
            }
        }
        if let Some(h) = *head {
            self.patch(h)?;
        }
        let engaged = self.engaged_nodes();
        let overlaps = self.collect_overlaps(block, offset, 4);

        // Aggregate into the word's existing bit patch when possible: the
        // word's other overlaps must already order before it.
        let existing = self
            .bdesc(block)?
            .bit_patches
            .get(&offset)
            .copied()
            .filter(|&p| self.patches.contains(p));
        if let Some(existing) = existing {
            let mergeable = {
                let p = self.patch(existing)?;
                !p.written && !p.in_flight && !p.rolled_back
            } && overlaps
                .iter()
                .all(|&o| o == existing || self.depends_on(existing, o))
                && self.merge_admissible(existing, *head, &engaged);
            if mergeable {
                if let Some(p) = self.patches.get_mut(existing) {
                    if let PatchKind::Bit { xor: mask, .. } = &mut p.kind {
                        *mask ^= xor;
                    }
                }
                self.apply_xor(block, offset, xor)?;
                self.attach_group_afters(existing, &engaged)?;
                *head = Some(existing);
                trace!(patch = %existing, offset, xor, "bit flip merged");
                return Ok(existing);
            }
        }

        self.precheck_group_cycles(*head, &overlaps, &engaged)?;

        self.apply_xor(block, offset, xor)?;
        let mut node = PatchNode::new(
            PatchKind::Bit { offset, xor },
            Some(block),
            Some(dev),
            level,
        );
        node.graph_index = Some(gindex);
        let pid = self.patches.insert(node);
        self.register_on_block(pid, block, gindex)?;
        self.bdesc_mut(block)?.bit_patches.insert(offset, pid);
        self.ready_list_insert(pid);

        if let Some(h) = *head {
            self.add_depend(pid, h)?;
        }
        for &o in &overlaps {
            self.add_depend(pid, o)?;
        }
        self.attach_groups(pid, &engaged)?;

        *head = Some(pid);
        trace!(patch = %pid, %block, offset, xor, "bit patch created");
        Ok(pid)
    }

    // ------------------------------------------------------------------
    // Empty patches
    // ------------------------------------------------------------------

    /// Creates an empty synchronization patch sequenced after `*head`.
    ///
    /// When `*head` is already a bare empty patch of the same owner with
    /// no dependents, it is reused instead of allocating a chain of
    /// no-ops. An empty patch created with no befores at all is satisfied
    /// immediately: an unconstrained join is vacuously complete.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for stale ids; [`EngineError::Cycle`]
    /// when group wiring would close a cycle.
    pub fn create_empty(
        &mut self,
        owner: Option<DevId>,
        head: &mut Option<PatchId>,
    ) -> Result<PatchId, EngineError> {
        if let Some(h) = *head {
            let collapsible = {
                let p = self.patch(h)?;
                p.is_empty_kind()
                    && !p.written
                    && !p.held
                    && !p.pinned
                    && p.owner == owner
                    && p.afters.is_empty()
            };
            if collapsible {
                return Ok(h);
            }
        }
        let engaged = self.engaged_nodes();
        self.precheck_group_cycles(*head, &[], &engaged)?;
        let pid = self.create_empty_node(owner, false, false)?;
        if let Some(h) = *head {
            self.add_depend(pid, h)?;
        }
        self.attach_groups(pid, &engaged)?;
        self.maybe_satisfy_empty(pid);
        *head = Some(pid);
        trace!(patch = %pid, "empty patch created");
        Ok(pid)
    }

    /// Creates an empty patch depending on every patch in `befores`.
    ///
    /// Befores that are already written contribute no edge; if none
    /// contributes one, the patch is satisfied immediately.
    ///
    /// # Errors
    /// As [`Engine::create_empty`].
    pub fn create_empty_array(
        &mut self,
        owner: Option<DevId>,
        befores: &[PatchId],
    ) -> Result<PatchId, EngineError> {
        for &b in befores {
            self.patch(b)?;
        }
        let engaged = self.engaged_nodes();
        self.precheck_group_cycles(None, befores, &engaged)?;
        let pid = self.create_empty_node(owner, false, false)?;
        for &b in befores {
            self.add_depend(pid, b)?;
        }
        self.attach_groups(pid, &engaged)?;
        self.maybe_satisfy_empty(pid);
        trace!(patch = %pid, count = befores.len(), "empty join created");
        Ok(pid)
    }

    /// Raw empty-node constructor shared with the patch-group layer; does
    /// not auto-satisfy.
    pub(crate) fn create_empty_node(
        &mut self,
        owner: Option<DevId>,
        held: bool,
        pinned: bool,
    ) -> Result<PatchId, EngineError> {
        let level = match owner {
            Some(dev) => self.device(dev)?.info.level,
            None => Level::MIN,
        };
        let mut node = PatchNode::new(PatchKind::Empty, None, owner, level);
        node.held = held;
        node.pinned = pinned;
        Ok(self.patches.insert(node))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns the block's non-rollbackable patch, if one is live.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `block` is stale.
    pub fn nrb_patch(&mut self, block: BdescId) -> Result<Option<PatchId>, EngineError> {
        self.bdesc(block)?;
        Ok(self.block_nrb(block))
    }

    /// Returns `true` when `patch` carries no rollback data.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `patch` is stale.
    pub fn patch_is_nonrollbackable(&self, patch: PatchId) -> Result<bool, EngineError> {
        Ok(self.patch(patch)?.is_nonrollbackable())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Resolves the block's NRB weak slot, lazily dropping a dead one.
    pub(crate) fn block_nrb(&mut self, block: BdescId) -> Option<PatchId> {
        let key = self.bdescs.get(block)?.nrb?;
        match self.weak_get_key(key) {
            Some(p) => Some(p),
            None => {
                self.weak_release_key(key);
                if let Some(bd) = self.bdescs.get_mut(block) {
                    bd.nrb = None;
                }
                None
            }
        }
    }

    /// A write may fold into `existing` when every implied before (the
    /// head and each engaged group's before-node) is already subsumed by
    /// `existing`'s before-closure or needs no edge at all.
    fn merge_admissible(
        &self,
        existing: PatchId,
        head: Option<PatchId>,
        engaged: &[(PatchId, PatchId)],
    ) -> bool {
        let Some(node) = self.patches.get(existing) else {
            return false;
        };
        if node.written || node.in_flight || node.rolled_back {
            return false;
        }
        let subsumed = |dep: PatchId| {
            dep == existing
                || self.patches.get(dep).is_none_or(|n| n.written)
                || self.depends_on(existing, dep)
        };
        // The engaged after-node must also be attachable above the
        // candidate without closing a cycle, since the merge commits the
        // buffer bytes before any edge is added.
        head.is_none_or(subsumed)
            && engaged.iter().all(|&(before, after)| {
                subsumed(before) && !self.depends_on(existing, after)
            })
    }

    /// Scans the merge candidates for a live byte patch of `dev` fully
    /// covering `[offset, offset + len)`: the block's most recent patch,
    /// then the range's overlap bucket, then the catch-all bucket. A
    /// candidate only qualifies when every other live patch overlapping
    /// the range already orders before it, since the merged bytes will
    /// take the candidate's position in the block's serial order.
    #[allow(clippy::too_many_arguments)]
    fn find_covering_patch(
        &self,
        block: BdescId,
        dev: DevId,
        offset: u32,
        len: u32,
        head: Option<PatchId>,
        engaged: &[(PatchId, PatchId)],
        overlaps: &[PatchId],
    ) -> Option<PatchId> {
        let bd = self.bdescs.get(block)?;
        let bucket = overlap1_bucket(offset, len);
        let candidates = bd
            .all_patches
            .last()
            .copied()
            .into_iter()
            .chain(bd.overlap1[bucket].iter().copied())
            .chain(bd.overlap1[0].iter().copied());
        for pid in candidates {
            let Some(p) = self.patches.get(pid) else {
                continue;
            };
            if p.owner != Some(dev) {
                continue;
            }
            let Some((p_off, p_len)) = p.byte_range() else {
                continue;
            };
            if p.is_nonrollbackable() {
                continue;
            }
            if p_off <= offset
                && offset + len <= p_off + p_len
                && overlaps
                    .iter()
                    .all(|&o| o == pid || self.depends_on(pid, o))
                && self.merge_admissible(pid, head, engaged)
            {
                return Some(pid);
            }
        }
        None
    }

    /// Live patches overlapping `[offset, offset + len)`, in-block serial
    /// order dependencies for a new patch: the NRB (every rollbackable
    /// patch on an NRB block follows it), overlapping byte patches via
    /// the overlap hash, and bit patches on intersecting words.
    fn collect_overlaps(&mut self, block: BdescId, offset: u32, len: u32) -> Vec<PatchId> {
        let mut out = Vec::new();
        if let Some(nrb) = self.block_nrb(block) {
            if self.patches.get(nrb).is_some_and(|p| !p.written) {
                out.push(nrb);
            }
        }
        let Some(bd) = self.bdescs.get(block) else {
            return out;
        };
        let first = offset >> OVERLAP1SHIFT;
        let last = (offset + len - 1) >> OVERLAP1SHIFT;
        let mut buckets = vec![0usize];
        if (last - first) as usize >= NOVERLAP1 {
            buckets.extend(1..=NOVERLAP1);
        } else {
            for g in first..=last {
                let bucket = 1 + (g as usize & (NOVERLAP1 - 1));
                if !buckets.contains(&bucket) {
                    buckets.push(bucket);
                }
            }
        }
        for bucket in buckets {
            for &pid in &bd.overlap1[bucket] {
                let Some(p) = self.patches.get(pid) else {
                    continue;
                };
                if p.written {
                    continue;
                }
                if let Some((p_off, p_len)) = p.byte_range() {
                    if ranges_overlap(offset, len, p_off, p_len) && !out.contains(&pid) {
                        out.push(pid);
                    }
                }
            }
        }
        let start = offset & !3;
        let end = offset + len;
        let mut word = start;
        while word < end {
            if let Some(&pid) = bd.bit_patches.get(&word) {
                if self.patches.get(pid).is_some_and(|p| !p.written) && !out.contains(&pid) {
                    out.push(pid);
                }
            }
            word += 4;
        }
        out
    }

    /// Non-rollbackable admission: one per block, and only while nothing
    /// could ever require rolling it back — no edges leaving the block, no
    /// other live patch on it, no engaged group, and an implied head that
    /// is absent, written, or strictly nearer the disk.
    fn nrb_admissible(
        &mut self,
        block: BdescId,
        level: Level,
        head: Option<PatchId>,
        engaged: &[(PatchId, PatchId)],
    ) -> Result<bool, EngineError> {
        if !cfg!(feature = "patch_nrb") {
            return Ok(false);
        }
        if !engaged.is_empty() || self.block_nrb(block).is_some() {
            return Ok(false);
        }
        let bd = self.bdesc(block)?;
        if bd.extern_after_count != 0 {
            return Ok(false);
        }
        if self.live_patch_count(block)? != 0 {
            return Ok(false);
        }
        let head_ok = match head {
            None => true,
            Some(h) => {
                let hn = self.patch(h)?;
                hn.written || hn.level > level
            }
        };
        Ok(head_ok)
    }

    fn apply_new_bytes(
        &mut self,
        block: BdescId,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        let bd = self.bdesc_mut(block)?;
        bd.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        bd.synthetic = false;
        Ok(())
    }

    fn apply_xor(&mut self, block: BdescId, offset: u32, xor: u32) -> Result<(), EngineError> {
        let bd = self.bdesc_mut(block)?;
        let word = &mut bd.data[offset as usize..offset as usize + 4];
        for (byte, mask) in word.iter_mut().zip(xor.to_le_bytes()) {
            *byte ^= mask;
        }
        bd.synthetic = false;
        Ok(())
    }

    fn register_on_block(
        &mut self,
        patch: PatchId,
        block: BdescId,
        gindex: GraphIndex,
    ) -> Result<(), EngineError> {
        let was_empty = {
            let bd = self.bdesc_mut(block)?;
            let was_empty = bd.all_patches.is_empty();
            bd.all_patches.push(patch);
            bd.index_patches[gindex.raw() as usize].push(patch);
            was_empty
        };
        if was_empty {
            self.bdesc_pin(block);
        }
        Ok(())
    }

    /// Rejects, before any state changes, group wiring that would close a
    /// cycle: a head or overlapped patch that already depends on an
    /// engaged group's after-node cannot also come before a new member of
    /// that group.
    fn precheck_group_cycles(
        &self,
        head: Option<PatchId>,
        overlaps: &[PatchId],
        engaged: &[(PatchId, PatchId)],
    ) -> Result<(), EngineError> {
        if engaged.is_empty() {
            return Ok(());
        }
        for &(_, after_node) in engaged {
            if let Some(h) = head {
                if self.depends_on(h, after_node) {
                    return Err(EngineError::Cycle);
                }
            }
            for &o in overlaps {
                if self.depends_on(o, after_node) {
                    return Err(EngineError::Cycle);
                }
            }
            // Two co-engaged groups ordered against each other cannot
            // share a member.
            for &(before_node, _) in engaged {
                if self.depends_on(before_node, after_node) {
                    return Err(EngineError::Cycle);
                }
            }
        }
        Ok(())
    }

    /// Hooks a freshly created patch below every engaged group: the patch
    /// follows the group's before-node and the group's after-node follows
    /// the patch.
    fn attach_groups(
        &mut self,
        patch: PatchId,
        engaged: &[(PatchId, PatchId)],
    ) -> Result<(), EngineError> {
        for &(before_node, after_node) in engaged {
            self.add_depend(patch, before_node)?;
            self.add_depend(after_node, patch)?;
        }
        Ok(())
    }

    /// Merge-path variant of group attachment: the surviving patch is
    /// already below every compatible before-node, so only the after-node
    /// edges are ensured.
    fn attach_group_afters(
        &mut self,
        patch: PatchId,
        engaged: &[(PatchId, PatchId)],
    ) -> Result<(), EngineError> {
        for &(_, after_node) in engaged {
            self.add_depend(after_node, patch)?;
        }
        Ok(())
    }

    /// Destroys overlapped patches a fresh byte patch fully covers, where
    /// nothing but the new patch depends on them. The survivor inherits
    /// their befores and pre-image bytes, and their weak references are
    /// rewritten to it.
    fn absorb_covered(
        &mut self,
        survivor: PatchId,
        block: BdescId,
        dev: DevId,
        offset: u32,
        len: u32,
        overlaps: &[PatchId],
    ) {
        for &old in overlaps {
            let absorbable = {
                let Some(p) = self.patches.get(old) else {
                    continue;
                };
                let covered = p
                    .byte_range()
                    .is_some_and(|(o, l)| offset <= o && o + l <= offset + len);
                covered
                    && !p.is_nonrollbackable()
                    && p.owner == Some(dev)
                    && !p.written
                    && !p.in_flight
                    && !p.rolled_back
                    && !p.pinned
                    && p.afters.len() == 1
                    && p.afters[0] == survivor
            };
            if !absorbable {
                continue;
            }
            // Fold the older pre-image into the survivor's swap buffer so
            // rolling the survivor back restores the state before both.
            let (old_off, old_stored) = {
                let Some(p) = self.patches.get(old) else {
                    continue;
                };
                let Some((o, _)) = p.byte_range() else {
                    continue;
                };
                let PatchKind::Byte {
                    stored: Some(stored),
                    ..
                } = &p.kind
                else {
                    continue;
                };
                (o, stored.clone())
            };
            if let Some(p) = self.patches.get_mut(survivor) {
                if let PatchKind::Byte {
                    stored: Some(stored),
                    ..
                } = &mut p.kind
                {
                    let at = (old_off - offset) as usize;
                    stored[at..at + old_stored.len()].copy_from_slice(&old_stored);
                }
            }
            let old_befores: Vec<PatchId> =
                self.patches.get(old).map(|p| p.befores.clone()).unwrap_or_default();
            for b in old_befores {
                self.unlink_edge(old, b);
                let redundant = b == survivor
                    || self
                        .patches
                        .get(survivor)
                        .is_some_and(|s| s.befores.contains(&b))
                    || self.depends_on(survivor, b);
                if !redundant {
                    self.link_edge(survivor, b);
                }
            }
            self.unlink_edge(survivor, old);
            self.weak_rewrite(old, survivor);
            self.drop_merged_patch(old);
        }
    }
}
