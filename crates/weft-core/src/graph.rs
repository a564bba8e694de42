// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dependency-graph operations: before/after edges, cycle avoidance,
//! ready-set maintenance, satisfaction, and deferred reclamation.
//!
//! An edge `(after, before)` reads "after must not reach disk before
//! before". Edges exist only while the before is unwritten: satisfying a
//! patch drains its after-edges, which is also what drives ready-set and
//! empty-patch satisfaction cascades. A patch is *ready* when no direct
//! before at a lower-or-equal level remains unwritten; the count is
//! memoized in `blocking_befores` and the per-block, per-level ready
//! lists are updated at every edge transition.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::engine::{Engine, EngineError};
use crate::ident::PatchId;

impl Engine {
    // ------------------------------------------------------------------
    // Public edge operations
    // ------------------------------------------------------------------

    /// Adds the dependency "`after` must not reach disk before `before`".
    ///
    /// Already-written befores need no edge and the call is a no-op, as is
    /// an edge that is already present or transitively implied. After a
    /// successful insert, direct edges of `after` that the new edge
    /// subsumes are removed to keep the graph compact.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for stale ids;
    /// - [`EngineError::Cycle`] when `before` already depends on `after`;
    /// - [`EngineError::Busy`] while `after` is in flight;
    /// - [`EngineError::InvalidLevel`] when the edge would strand a
    ///   non-rollbackable patch behind an unwritten before at a
    ///   lower-or-equal level (see the crate docs on non-rollbackable
    ///   admission).
    pub fn add_depend(&mut self, after: PatchId, before: PatchId) -> Result<(), EngineError> {
        if after == before {
            return Err(EngineError::Cycle);
        }
        let (a_level, a_in_flight, a_nrb) = {
            let a = self.patch(after)?;
            (a.level, a.in_flight, a.is_nonrollbackable())
        };
        let (b_written, b_level) = {
            let b = self.patch(before)?;
            (b.written, b.level)
        };
        if b_written {
            return Ok(());
        }
        if a_in_flight {
            return Err(EngineError::Busy);
        }
        if self.patch(after)?.befores.contains(&before) {
            return Ok(());
        }
        if self.depends_on(after, before) {
            return Ok(());
        }
        if self.depends_on(before, after) {
            return Err(EngineError::Cycle);
        }
        if a_nrb && b_level <= a_level {
            return Err(EngineError::InvalidLevel);
        }
        self.link_edge(after, before);
        // Transitive simplification: the new edge subsumes any direct edge
        // onto something `before` already depends on.
        let direct: Vec<PatchId> = self.patch(after)?.befores.clone();
        for c in direct {
            if c != before && self.depends_on(before, c) {
                self.unlink_edge(after, c);
            }
        }
        trace!(%after, %before, "dependency added");
        Ok(())
    }

    /// Removes a previously added dependency.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for stale ids or a missing edge;
    /// - [`EngineError::Busy`] while `after` is in flight.
    pub fn remove_depend(&mut self, after: PatchId, before: PatchId) -> Result<(), EngineError> {
        if self.patch(after)?.in_flight {
            return Err(EngineError::Busy);
        }
        self.patch(before)?;
        if !self.patch(after)?.befores.contains(&before) {
            return Err(EngineError::NotFound);
        }
        self.unlink_edge(after, before);
        trace!(%after, %before, "dependency removed");
        Ok(())
    }

    /// Returns `true` when `after` transitively depends on `before`.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for stale ids.
    pub fn patch_depends_on(
        &self,
        after: PatchId,
        before: PatchId,
    ) -> Result<bool, EngineError> {
        self.patch(after)?;
        self.patch(before)?;
        Ok(self.depends_on(after, before))
    }

    /// Returns `true` when `to` is reachable from `from` along
    /// before-edges (`from` transitively depends on `to`).
    pub(crate) fn depends_on(&self, from: PatchId, to: PatchId) -> bool {
        if from == to {
            return true;
        }
        let mut seen: FxHashSet<PatchId> = FxHashSet::default();
        let mut stack = vec![from];
        while let Some(p) = stack.pop() {
            if !seen.insert(p) {
                continue;
            }
            if let Some(node) = self.patches.get(p) {
                for &b in &node.befores {
                    if b == to {
                        return true;
                    }
                    stack.push(b);
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Internal edge plumbing
    // ------------------------------------------------------------------

    /// Inserts the edge into both adjacency lists and updates extern and
    /// blocking accounting. Callers guarantee both patches are live, the
    /// edge is absent, and `before` is unwritten.
    pub(crate) fn link_edge(&mut self, after: PatchId, before: PatchId) {
        let (a_target, a_level) = {
            let a = match self.patches.get_mut(after) {
                Some(a) => a,
                None => return,
            };
            a.befores.push(before);
            (a.target, a.level)
        };
        let (b_target, b_level) = {
            let b = match self.patches.get_mut(before) {
                Some(b) => b,
                None => return,
            };
            b.afters.push(after);
            (b.target, b.level)
        };
        if let Some(bb) = b_target {
            if a_target != Some(bb) {
                if let Some(bd) = self.bdescs.get_mut(bb) {
                    bd.extern_after_count += 1;
                }
            }
        }
        if b_level <= a_level {
            let newly_blocked = {
                let a = match self.patches.get_mut(after) {
                    Some(a) => a,
                    None => return,
                };
                a.blocking_befores += 1;
                a.blocking_befores == 1
            };
            if newly_blocked {
                self.ready_list_remove(after);
            }
        }
    }

    /// Removes the edge from both adjacency lists and updates extern and
    /// blocking accounting, possibly satisfying an empty `after`. Callers
    /// guarantee the edge exists and `before` is unwritten.
    pub(crate) fn unlink_edge(&mut self, after: PatchId, before: PatchId) {
        let (a_target, a_level) = {
            let a = match self.patches.get_mut(after) {
                Some(a) => a,
                None => return,
            };
            if let Some(pos) = a.befores.iter().position(|&x| x == before) {
                a.befores.remove(pos);
            }
            (a.target, a.level)
        };
        let (b_target, b_level) = {
            let b = match self.patches.get_mut(before) {
                Some(b) => b,
                None => return,
            };
            if let Some(pos) = b.afters.iter().position(|&x| x == after) {
                b.afters.remove(pos);
            }
            (b.target, b.level)
        };
        if let Some(bb) = b_target {
            if a_target != Some(bb) {
                if let Some(bd) = self.bdescs.get_mut(bb) {
                    debug_assert!(bd.extern_after_count > 0);
                    bd.extern_after_count = bd.extern_after_count.saturating_sub(1);
                }
            }
        }
        if b_level <= a_level {
            let now_ready = {
                let a = match self.patches.get_mut(after) {
                    Some(a) => a,
                    None => return,
                };
                debug_assert!(a.blocking_befores > 0);
                a.blocking_befores = a.blocking_befores.saturating_sub(1);
                a.blocking_befores == 0 && !a.written && a.target.is_some()
            };
            if now_ready {
                self.ready_list_insert(after);
            }
        }
        self.maybe_satisfy_empty(after);
    }

    // ------------------------------------------------------------------
    // Ready lists
    // ------------------------------------------------------------------

    pub(crate) fn ready_list_insert(&mut self, patch: PatchId) {
        let (target, level, listed) = match self.patches.get(patch) {
            Some(p) => (p.target, p.level, p.in_ready_list),
            None => return,
        };
        let Some(block) = target else { return };
        if listed {
            return;
        }
        if let Some(bd) = self.bdescs.get_mut(block) {
            bd.ready_patches[level.raw() as usize].push(patch);
        }
        if let Some(p) = self.patches.get_mut(patch) {
            p.in_ready_list = true;
        }
    }

    pub(crate) fn ready_list_remove(&mut self, patch: PatchId) {
        let (target, level, listed) = match self.patches.get(patch) {
            Some(p) => (p.target, p.level, p.in_ready_list),
            None => return,
        };
        if !listed {
            return;
        }
        if let Some(block) = target {
            if let Some(bd) = self.bdescs.get_mut(block) {
                let list = &mut bd.ready_patches[level.raw() as usize];
                if let Some(pos) = list.iter().position(|&x| x == patch) {
                    list.remove(pos);
                }
            }
        }
        if let Some(p) = self.patches.get_mut(patch) {
            p.in_ready_list = false;
        }
    }

    // ------------------------------------------------------------------
    // Satisfaction
    // ------------------------------------------------------------------

    /// Satisfies an empty patch whose befores have drained, unless it is
    /// held (patch-group gating) or already written.
    pub(crate) fn maybe_satisfy_empty(&mut self, patch: PatchId) {
        let satisfiable = match self.patches.get(patch) {
            Some(p) => {
                p.is_empty_kind() && !p.written && !p.held && p.befores.is_empty()
            }
            None => false,
        };
        if satisfiable {
            self.satisfy_patch(patch);
        }
    }

    /// Marks a patch written (satisfied), drains its after-edges, updates
    /// ready sets, cascades through empty patches, and enqueues the patch
    /// for reclamation.
    pub(crate) fn satisfy_patch(&mut self, patch: PatchId) {
        let mut work = vec![patch];
        while let Some(p) = work.pop() {
            let (p_level, p_target) = {
                let Some(node) = self.patches.get_mut(p) else {
                    continue;
                };
                if node.written {
                    continue;
                }
                node.written = true;
                node.in_flight = false;
                (node.level, node.target)
            };
            self.ready_list_remove(p);
            let afters = {
                let Some(node) = self.patches.get_mut(p) else {
                    continue;
                };
                std::mem::take(&mut node.afters)
            };
            for a in afters {
                let mut make_ready = false;
                let mut cascade = false;
                let a_target = {
                    let Some(an) = self.patches.get_mut(a) else {
                        continue;
                    };
                    if let Some(pos) = an.befores.iter().position(|&x| x == p) {
                        an.befores.remove(pos);
                    }
                    if p_level <= an.level {
                        debug_assert!(an.blocking_befores > 0);
                        an.blocking_befores = an.blocking_befores.saturating_sub(1);
                        make_ready =
                            an.blocking_befores == 0 && !an.written && an.target.is_some();
                    }
                    cascade = an.is_empty_kind()
                        && !an.written
                        && !an.held
                        && an.befores.is_empty();
                    an.target
                };
                if let Some(pb) = p_target {
                    if a_target != Some(pb) {
                        if let Some(bd) = self.bdescs.get_mut(pb) {
                            debug_assert!(bd.extern_after_count > 0);
                            bd.extern_after_count = bd.extern_after_count.saturating_sub(1);
                        }
                    }
                }
                if make_ready {
                    self.ready_list_insert(a);
                }
                if cascade {
                    work.push(a);
                }
            }
            self.enqueue_reclaim(p);
            trace!(patch = %p, "patch satisfied");
        }
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    pub(crate) fn enqueue_reclaim(&mut self, patch: PatchId) {
        if let Some(node) = self.patches.get_mut(patch) {
            if !node.queued_free {
                node.queued_free = true;
                self.free_queue.push(patch);
            }
        }
    }

    /// Deferred reclamation pass: frees every satisfied patch with no
    /// remaining afters and no group pin, then sweeps abandoned groups
    /// whose endpoint patches are gone. Runs at the end of write
    /// acknowledgement and autorelease pops so list iteration elsewhere
    /// stays predictable.
    pub(crate) fn run_reclaim(&mut self) {
        while let Some(patch) = self.free_queue.pop() {
            let eligible = match self.patches.get_mut(patch) {
                Some(node) => {
                    node.queued_free = false;
                    node.written && node.afters.is_empty() && !node.pinned
                }
                None => false,
            };
            if eligible {
                self.reclaim_patch(patch);
            }
        }
        self.sweep_zombie_groups();
    }

    fn reclaim_patch(&mut self, patch: PatchId) {
        self.weak_clear(patch);
        let Some(node) = self.patches.remove(patch) else {
            return;
        };
        debug_assert!(node.written && node.afters.is_empty());
        debug_assert!(!node.in_ready_list);
        for b in &node.befores {
            let b_target = match self.patches.get_mut(*b) {
                Some(bn) => {
                    if let Some(pos) = bn.afters.iter().position(|&x| x == patch) {
                        bn.afters.remove(pos);
                    }
                    bn.target
                }
                None => continue,
            };
            if let Some(bb) = b_target {
                if node.target != Some(bb) {
                    if let Some(bd) = self.bdescs.get_mut(bb) {
                        debug_assert!(bd.extern_after_count > 0);
                        bd.extern_after_count = bd.extern_after_count.saturating_sub(1);
                    }
                }
            }
        }
        if let Some(block) = node.target {
            let last = {
                let Some(bd) = self.bdescs.get_mut(block) else {
                    return;
                };
                if let Some(pos) = bd.all_patches.iter().position(|&x| x == patch) {
                    bd.all_patches.remove(pos);
                }
                if let Some(index) = node.graph_index {
                    let list = &mut bd.index_patches[index.raw() as usize];
                    if let Some(pos) = list.iter().position(|&x| x == patch) {
                        list.remove(pos);
                    }
                }
                if let Some(bucket) = node.overlap_bucket {
                    let list = &mut bd.overlap1[bucket];
                    if let Some(pos) = list.iter().position(|&x| x == patch) {
                        list.remove(pos);
                    }
                }
                if let crate::patch::PatchKind::Bit { offset, .. } = node.kind {
                    if bd.bit_patches.get(&offset) == Some(&patch) {
                        bd.bit_patches.remove(&offset);
                    }
                }
                bd.all_patches.is_empty()
            };
            if last {
                self.bdesc_unpin(block);
            }
        }
        trace!(patch = %patch, "patch reclaimed");
    }

    /// Destroys an unwritten patch that a merge absorbed into `survivor`.
    /// Callers have already transferred its edges; both adjacency lists
    /// must be empty.
    pub(crate) fn drop_merged_patch(&mut self, patch: PatchId) {
        self.ready_list_remove(patch);
        let Some(node) = self.patches.remove(patch) else {
            return;
        };
        debug_assert!(node.befores.is_empty() && node.afters.is_empty());
        if let Some(block) = node.target {
            if let Some(bd) = self.bdescs.get_mut(block) {
                if let Some(pos) = bd.all_patches.iter().position(|&x| x == patch) {
                    bd.all_patches.remove(pos);
                }
                if let Some(index) = node.graph_index {
                    let list = &mut bd.index_patches[index.raw() as usize];
                    if let Some(pos) = list.iter().position(|&x| x == patch) {
                        list.remove(pos);
                    }
                }
                if let Some(bucket) = node.overlap_bucket {
                    let list = &mut bd.overlap1[bucket];
                    if let Some(pos) = list.iter().position(|&x| x == patch) {
                        list.remove(pos);
                    }
                }
            }
        }
        trace!(patch = %patch, "patch merged away");
    }
}
