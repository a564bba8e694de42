// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine handle, error kinds, weak references, invariant checks.
//!
//! All engine state — patch and bdesc arenas, the weak-slot table, device
//! records, patch-group scopes, the autorelease stack — hangs off one
//! [`Engine`] value. The engine assumes a single-threaded cooperative
//! discipline: no operation suspends internally, every invariant holds
//! between operations, and block devices are only entered at the
//! well-defined points of the revision protocol.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::trace;

use crate::arena::Arena;
use crate::bdesc::BdescNode;
use crate::constants::STATIC_AUTO_POOLS;
use crate::device::DeviceRecord;
use crate::group::{Group, Scope};
use crate::ident::{BdescId, DevId, GroupId, PatchId, WeakKey};
use crate::patch::PatchNode;

/// Errors emitted by the engine.
///
/// Synchronous failures leave no partial state behind; I/O failures are
/// absorbed by the revision revert path (the affected patches simply remain
/// unwritten and eligible for a retry).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// An edge or patch admission would violate level ordering — most
    /// commonly a dependency that would strand a non-rollbackable patch
    /// behind an unwritten before at a lower-or-equal level.
    #[error("level ordering violated")]
    InvalidLevel,
    /// The requested dependency would create a cycle.
    #[error("dependency would create a cycle")]
    Cycle,
    /// The operation is not allowed in the object's current state (patch
    /// group state table, autorelease misuse, device registration).
    #[error("operation not allowed in current state")]
    InvalidState,
    /// An identifier was unknown or stale (its object was reclaimed).
    #[error("unknown or stale identifier")]
    NotFound,
    /// A block device reported a write failure.
    #[error("block device reported a write failure")]
    IoFailed,
    /// The resource is busy (block in flight, unwritten work at shutdown,
    /// a sync that cannot make progress).
    #[error("resource busy")]
    Busy,
    /// A byte range fell outside the block bounds or was empty.
    #[error("byte range outside block bounds")]
    InvalidOffset,
    /// An internal invariant was violated. Indicates a bug in the engine
    /// or a caller breaking the single-threaded discipline, never user
    /// error.
    #[error("internal invariant violated: {0}")]
    InternalCorruption(&'static str),
}

/// A weak-slot value: the patch currently referenced, or `None` once the
/// patch was reclaimed with no merge survivor.
#[derive(Debug)]
pub(crate) struct WeakSlot {
    pub(crate) target: Option<PatchId>,
}

/// Weak reference to a patch.
///
/// Obtained from [`Engine::weak_retain`]. When the referenced patch is
/// merged into another, the slot is rewritten to the survivor; when it is
/// reclaimed outright, the slot is cleared. Weak references never prevent
/// reclamation. Release with [`Engine::weak_release`]; the handle is
/// deliberately neither `Copy` nor `Clone` so each slot has one owner.
#[derive(Debug)]
pub struct PatchWeak(pub(crate) WeakKey);

/// The modification-ordering engine.
///
/// One `Engine` owns every patch, block descriptor, weak slot, device
/// record, and patch-group scope. Thread it as an explicit `&mut` handle;
/// the borrow discipline is what enforces the single-threaded cooperative
/// model of the design.
#[derive(Debug)]
pub struct Engine {
    pub(crate) patches: Arena<PatchId, PatchNode>,
    pub(crate) bdescs: Arena<BdescId, BdescNode>,
    pub(crate) weak_slots: Arena<WeakKey, WeakSlot>,
    pub(crate) devices: Vec<DeviceRecord>,
    pub(crate) groups: BTreeMap<GroupId, Group>,
    pub(crate) scope: Scope,
    pub(crate) next_group: u32,
    pub(crate) autorelease_stack: Vec<Vec<BdescId>>,
    /// Patches awaiting the deferred reclamation pass.
    pub(crate) free_queue: Vec<PatchId>,
    /// Abandoned groups whose endpoint patches may still be live.
    pub(crate) zombie_groups: Vec<GroupId>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        let mut autorelease_stack = Vec::new();
        autorelease_stack.reserve(STATIC_AUTO_POOLS);
        Self {
            patches: Arena::new(),
            bdescs: Arena::new(),
            weak_slots: Arena::new(),
            devices: Vec::new(),
            groups: BTreeMap::new(),
            scope: Scope::new(),
            next_group: 0,
            autorelease_stack,
            free_queue: Vec::new(),
            zombie_groups: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Internal accessors
    // ------------------------------------------------------------------

    pub(crate) fn patch(&self, id: PatchId) -> Result<&PatchNode, EngineError> {
        self.patches.get(id).ok_or(EngineError::NotFound)
    }

    pub(crate) fn patch_mut(&mut self, id: PatchId) -> Result<&mut PatchNode, EngineError> {
        self.patches.get_mut(id).ok_or(EngineError::NotFound)
    }

    pub(crate) fn bdesc(&self, id: BdescId) -> Result<&BdescNode, EngineError> {
        self.bdescs.get(id).ok_or(EngineError::NotFound)
    }

    pub(crate) fn bdesc_mut(&mut self, id: BdescId) -> Result<&mut BdescNode, EngineError> {
        self.bdescs.get_mut(id).ok_or(EngineError::NotFound)
    }

    pub(crate) fn device(&self, id: DevId) -> Result<&DeviceRecord, EngineError> {
        self.devices.get(id.0 as usize).ok_or(EngineError::NotFound)
    }

    pub(crate) fn device_mut(&mut self, id: DevId) -> Result<&mut DeviceRecord, EngineError> {
        self.devices
            .get_mut(id.0 as usize)
            .ok_or(EngineError::NotFound)
    }

    pub(crate) fn group(&self, id: GroupId) -> Result<&Group, EngineError> {
        self.groups.get(&id).ok_or(EngineError::NotFound)
    }

    pub(crate) fn group_mut(&mut self, id: GroupId) -> Result<&mut Group, EngineError> {
        self.groups.get_mut(&id).ok_or(EngineError::NotFound)
    }

    // ------------------------------------------------------------------
    // Weak references
    // ------------------------------------------------------------------

    /// Creates a weak reference to `patch`.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `patch` is stale.
    pub fn weak_retain(&mut self, patch: PatchId) -> Result<PatchWeak, EngineError> {
        let key = self.weak_retain_key(patch)?;
        Ok(PatchWeak(key))
    }

    pub(crate) fn weak_retain_key(&mut self, patch: PatchId) -> Result<WeakKey, EngineError> {
        if !self.patches.contains(patch) {
            return Err(EngineError::NotFound);
        }
        let key = self.weak_slots.insert(WeakSlot {
            target: Some(patch),
        });
        if let Some(node) = self.patches.get_mut(patch) {
            node.weak_slots.push(key);
        }
        Ok(key)
    }

    /// Resolves a weak reference to the patch it currently tracks.
    ///
    /// Returns `None` once the patch has been reclaimed with no merge
    /// survivor.
    #[must_use]
    pub fn weak_get(&self, weak: &PatchWeak) -> Option<PatchId> {
        self.weak_get_key(weak.0)
    }

    pub(crate) fn weak_get_key(&self, key: WeakKey) -> Option<PatchId> {
        self.weak_slots.get(key).and_then(|slot| slot.target)
    }

    /// Releases a weak reference, dropping its slot.
    pub fn weak_release(&mut self, weak: PatchWeak) {
        self.weak_release_key(weak.0);
    }

    pub(crate) fn weak_release_key(&mut self, key: WeakKey) {
        if let Some(slot) = self.weak_slots.remove(key) {
            if let Some(target) = slot.target {
                if let Some(node) = self.patches.get_mut(target) {
                    node.weak_slots.retain(|k| *k != key);
                }
            }
        }
    }

    /// Rewrites every weak slot tracking `from` to track `to` instead.
    /// Used when a merge destroys `from` in favor of `to`.
    pub(crate) fn weak_rewrite(&mut self, from: PatchId, to: PatchId) {
        let keys = match self.patches.get_mut(from) {
            Some(node) => std::mem::take(&mut node.weak_slots),
            None => return,
        };
        for key in &keys {
            if let Some(slot) = self.weak_slots.get_mut(*key) {
                slot.target = Some(to);
            }
        }
        if let Some(node) = self.patches.get_mut(to) {
            node.weak_slots.extend(keys);
        }
        trace!(%from, %to, "weak refs rewritten to merge survivor");
    }

    /// Clears every weak slot tracking `patch`. Used at reclamation.
    pub(crate) fn weak_clear(&mut self, patch: PatchId) {
        let keys = match self.patches.get_mut(patch) {
            Some(node) => std::mem::take(&mut node.weak_slots),
            None => return,
        };
        for key in keys {
            if let Some(slot) = self.weak_slots.get_mut(key) {
                slot.target = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns `true` while `patch` is live (not yet reclaimed).
    #[must_use]
    pub fn patch_alive(&self, patch: PatchId) -> bool {
        self.patches.contains(patch)
    }

    /// Returns `true` once `patch` has been written (or satisfied, for
    /// empty patches).
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `patch` is stale.
    pub fn patch_written(&self, patch: PatchId) -> Result<bool, EngineError> {
        Ok(self.patch(patch)?.written)
    }

    /// Returns the level `patch` was created at.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if `patch` is stale.
    pub fn patch_level(&self, patch: PatchId) -> Result<crate::Level, EngineError> {
        Ok(self.patch(patch)?.level)
    }

    /// Number of live patches across the whole engine.
    #[must_use]
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Number of live block descriptors across the whole engine.
    #[must_use]
    pub fn bdesc_count(&self) -> usize {
        self.bdescs.len()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Ordered tear-down: runs a final reclamation pass, then verifies the
    /// engine is quiescent.
    ///
    /// # Errors
    /// - [`EngineError::Busy`] when unwritten patches, in-flight blocks,
    ///   retained bdescs, or live groups remain;
    /// - [`EngineError::InvalidState`] when autorelease pools are still
    ///   pushed;
    /// - any invariant violation reported by [`Self::check_invariants`].
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.run_reclaim();
        if !self.autorelease_stack.is_empty() {
            return Err(EngineError::InvalidState);
        }
        if self.patches.len() != 0 {
            return Err(EngineError::Busy);
        }
        for (_, bd) in self.bdescs.iter() {
            if bd.in_flight || bd.ref_count > 0 {
                return Err(EngineError::Busy);
            }
        }
        if !self.groups.is_empty() {
            return Err(EngineError::Busy);
        }
        self.check_invariants()
    }

    /// Walks the arenas verifying the quantified invariants: ready-list
    /// correctness, acyclicity over unwritten patches, refcount floors,
    /// adjacency symmetry, and extern-after counts.
    ///
    /// # Errors
    /// [`EngineError::InternalCorruption`] naming the first violated
    /// invariant.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        self.check_bdesc_invariants()?;
        self.check_patch_invariants()?;
        self.check_acyclic()
    }

    fn check_bdesc_invariants(&self) -> Result<(), EngineError> {
        for (bid, bd) in self.bdescs.iter() {
            if bd.ar_count > bd.ref_count {
                return Err(EngineError::InternalCorruption(
                    "autorelease count exceeds reference count",
                ));
            }
            if bd.data.len() != bd.length as usize {
                return Err(EngineError::InternalCorruption(
                    "bdesc data length mismatch",
                ));
            }
            let mut extern_afters = 0;
            for &pid in &bd.all_patches {
                let patch = self
                    .patches
                    .get(pid)
                    .ok_or(EngineError::InternalCorruption("stale patch on block list"))?;
                if patch.target != Some(bid) {
                    return Err(EngineError::InternalCorruption(
                        "block list patch targets another block",
                    ));
                }
                for &after in &patch.afters {
                    let a = self.patches.get(after).ok_or(
                        EngineError::InternalCorruption("stale after edge"),
                    )?;
                    if a.target != Some(bid) {
                        extern_afters += 1;
                    }
                }
            }
            if extern_afters != bd.extern_after_count {
                return Err(EngineError::InternalCorruption(
                    "extern after count out of sync",
                ));
            }
            for (level, list) in bd.ready_patches.iter().enumerate() {
                for &pid in list {
                    let patch = self.patches.get(pid).ok_or(
                        EngineError::InternalCorruption("stale patch on ready list"),
                    )?;
                    if patch.level.raw() as usize != level
                        || patch.written
                        || patch.blocking_befores != 0
                    {
                        return Err(EngineError::InternalCorruption(
                            "ready list contains non-ready patch",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_patch_invariants(&self) -> Result<(), EngineError> {
        for (pid, patch) in self.patches.iter() {
            if patch.written && !patch.afters.is_empty() {
                return Err(EngineError::InternalCorruption(
                    "written patch retains afters",
                ));
            }
            let mut blocking = 0;
            for &before in &patch.befores {
                let b = self
                    .patches
                    .get(before)
                    .ok_or(EngineError::InternalCorruption("stale before edge"))?;
                if b.written {
                    return Err(EngineError::InternalCorruption(
                        "edge onto written patch survived satisfaction",
                    ));
                }
                if !b.afters.contains(&pid) {
                    return Err(EngineError::InternalCorruption(
                        "before edge missing reverse entry",
                    ));
                }
                if b.level <= patch.level {
                    blocking += 1;
                }
            }
            if blocking != patch.blocking_befores {
                return Err(EngineError::InternalCorruption(
                    "blocking-before count out of sync",
                ));
            }
            for &after in &patch.afters {
                let a = self
                    .patches
                    .get(after)
                    .ok_or(EngineError::InternalCorruption("stale after edge"))?;
                if !a.befores.contains(&pid) {
                    return Err(EngineError::InternalCorruption(
                        "after edge missing reverse entry",
                    ));
                }
            }
            if patch.rolled_back && patch.target.is_none_or(|t| {
                self.bdescs.get(t).is_none_or(|bd| !bd.in_flight)
            }) {
                return Err(EngineError::InternalCorruption(
                    "rolled-back patch outside a revision slice",
                ));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over unwritten patches; leftover nodes mean a
    /// cycle.
    fn check_acyclic(&self) -> Result<(), EngineError> {
        use rustc_hash::FxHashMap;
        let mut indegree: FxHashMap<PatchId, usize> = FxHashMap::default();
        let mut total = 0usize;
        for (pid, patch) in self.patches.iter() {
            if patch.written {
                continue;
            }
            total += 1;
            indegree.entry(pid).or_insert(0);
            for &before in &patch.befores {
                *indegree.entry(before).or_insert(0) += 1;
            }
        }
        let mut queue: Vec<PatchId> = indegree
            .iter()
            .filter_map(|(&pid, &deg)| (deg == 0).then_some(pid))
            .collect();
        let mut visited = 0usize;
        while let Some(pid) = queue.pop() {
            visited += 1;
            if let Some(patch) = self.patches.get(pid) {
                for &before in &patch.befores {
                    if let Some(deg) = indegree.get_mut(&before) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push(before);
                        }
                    }
                }
            }
        }
        if visited == total {
            Ok(())
        } else {
            Err(EngineError::InternalCorruption(
                "cycle among unwritten patches",
            ))
        }
    }
}
