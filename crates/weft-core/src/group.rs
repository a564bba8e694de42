// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Patch groups: application-visible bulk-ordering handles.
//!
//! A group is a pair of empty patches. Members (patches created while the
//! group is engaged) depend on the *before-node*; the *after-node* depends
//! on every member, so outside work that must follow the whole group
//! depends on the after-node alone. Ordering two groups
//! (`group_add_depend`) wires one group's before-node under the other's
//! after-node, and the after-node additionally depends on the before-node
//! from birth so group-of-group cycles surface in the ordinary patch
//! cycle check even while a group is empty.
//!
//! The before-node is *held* (never auto-satisfied) until the group is
//! released; release is therefore the gate that lets members start
//! reaching disk once their inter-group befores are written. For atomic
//! groups the held before-node doubles as the commit point a journal
//! layer arms. The after-node stays held until the group is abandoned —
//! members can arrive as long as the group can be engaged — so work
//! ordered after a whole group proceeds once that group is abandoned and
//! its members are written. [`Engine::group_complete`] consequently reads
//! completion off the after-node's drained befores, not its written bit.
//!
//! State is four bits — has-afters (A), released (R), engaged-at-least-
//! once (W), has-befores (B) — with these legal operations:
//!
//! | state       | add-after | release    | engage | add-before | abandon |
//! |-------------|-----------|------------|--------|------------|---------|
//! | A0 R0       | yes       | yes        | no     | yes        | no      |
//! | A0 R1       | yes       | idempotent | yes    | no         | yes     |
//! | A1 R0 W0    | yes       | yes        | no     | no         | no      |
//! | A1 R0 W1    | yes       | yes        | no     | yes        | no      |
//! | A1 R1       | yes       | idempotent | no     | no         | yes     |
//!
//! Add-before is denied for an engaged-never group that already has
//! afters, which is what keeps the group-of-groups graph acyclic-checkable
//! cheaply. Atomic groups differ: engage requires *not* released, release
//! requires disengaged, and abandon always requires released. Hidden
//! non-atomic groups may be abandoned without release; the hidden bit an
//! atomic group carries implicitly grants no such shortcut.
//!
//! Groups live in *scopes*. Operations consult the engine's current
//! scope; [`Engine::scope_copy`] duplicates it (modelling `fork`), and a
//! destroyed scope releases and retires any group it held the last
//! reference to.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::device::{BlockDevice, FlushProgress, FlushTarget};
use crate::engine::{Engine, EngineError};
use crate::ident::{GroupId, PatchId, WeakKey};

/// Creation flags for a patch group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupFlags {
    /// All-or-nothing: members reach disk together or not at all (the
    /// engine provides the commit-node wiring; a journal layer arms it).
    /// Implies `hidden`.
    pub atomic: bool,
    /// Not visible to peer scopes; may be abandoned without release.
    pub hidden: bool,
}

#[derive(Debug)]
pub(crate) struct Group {
    pub(crate) before_node: WeakKey,
    pub(crate) after_node: WeakKey,
    pub(crate) atomic: bool,
    pub(crate) hidden: bool,
    pub(crate) has_afters: bool,
    pub(crate) has_befores: bool,
    /// The W bit: the group has been engaged at least once.
    pub(crate) wrote: bool,
    pub(crate) released: bool,
    /// Engagements across all scopes referencing the group.
    pub(crate) engaged_count: u32,
    /// Scopes referencing the group.
    pub(crate) refs: u32,
    pub(crate) abandoned: bool,
    pub(crate) label: Option<String>,
}

/// A set of patch groups plus their engagement order.
///
/// The engine always has a current scope; detached scopes exist only
/// between [`Engine::scope_copy`] and [`Engine::scope_swap`] /
/// [`Engine::scope_destroy`].
#[derive(Debug, Default)]
pub struct Scope {
    pub(crate) members: BTreeSet<GroupId>,
    pub(crate) engaged: Vec<GroupId>,
}

impl Scope {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl Engine {
    fn scope_member(&self, group: GroupId) -> Result<(), EngineError> {
        if self.scope.members.contains(&group) {
            Ok(())
        } else {
            Err(EngineError::NotFound)
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Creates a patch group in the current scope.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] if endpoint allocation fails to resolve
    /// (stale state), which indicates a bug.
    pub fn group_create(&mut self, flags: GroupFlags) -> Result<GroupId, EngineError> {
        let before = self.create_empty_node(None, true, true)?;
        // The after-node is held for the group's whole lifetime: the group
        // can gain members until it is abandoned, so its completion node
        // must not satisfy early.
        let after = self.create_empty_node(None, true, true)?;
        self.add_depend(after, before)?;
        let before_node = self.weak_retain_key(before)?;
        let after_node = self.weak_retain_key(after)?;
        let id = GroupId(self.next_group);
        self.next_group += 1;
        self.groups.insert(
            id,
            Group {
                before_node,
                after_node,
                atomic: flags.atomic,
                hidden: flags.hidden || flags.atomic,
                has_afters: false,
                has_befores: false,
                wrote: false,
                released: false,
                engaged_count: 0,
                refs: 1,
                abandoned: false,
                label: None,
            },
        );
        self.scope.members.insert(id);
        debug!(group = %id, atomic = flags.atomic, "patch group created");
        Ok(id)
    }

    /// Releases the group: no further befores may be added, and the
    /// before-node's hold is dropped so members may start reaching disk
    /// once their inter-group befores are written. Idempotent.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for a group outside the current scope;
    /// - [`EngineError::InvalidState`] for an atomic group that is still
    ///   engaged.
    pub fn group_release(&mut self, group: GroupId) -> Result<(), EngineError> {
        self.scope_member(group)?;
        {
            let g = self.group(group)?;
            if g.released {
                return Ok(());
            }
            if g.atomic && g.engaged_count > 0 {
                return Err(EngineError::InvalidState);
            }
        }
        self.group_release_inner(group)
    }

    fn group_release_inner(&mut self, group: GroupId) -> Result<(), EngineError> {
        let before_key = {
            let g = self.group_mut(group)?;
            g.released = true;
            g.before_node
        };
        if let Some(before) = self.weak_get_key(before_key) {
            if let Some(p) = self.patches.get_mut(before) {
                p.held = false;
            }
            self.maybe_satisfy_empty(before);
            self.run_reclaim();
        }
        debug!(group = %group, "patch group released");
        Ok(())
    }

    /// Engages the group in the current scope: until disengaged, every
    /// patch created gains a path from the group's before-node and the
    /// group's after-node gains a path from the patch.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for a group outside the current scope;
    /// - [`EngineError::InvalidState`] when the state table forbids it
    ///   (non-atomic: not yet released, or the group already has afters;
    ///   atomic: already released).
    pub fn group_engage(&mut self, group: GroupId) -> Result<(), EngineError> {
        self.scope_member(group)?;
        {
            let g = self.group(group)?;
            let allowed = if g.atomic {
                !g.released
            } else {
                g.released && !g.has_afters
            };
            if !allowed {
                return Err(EngineError::InvalidState);
            }
        }
        if self.scope.engaged.contains(&group) {
            return Ok(());
        }
        self.scope.engaged.push(group);
        let g = self.group_mut(group)?;
        g.engaged_count += 1;
        g.wrote = true;
        debug!(group = %group, "patch group engaged");
        Ok(())
    }

    /// Disengages the group in the current scope.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for a group outside the current scope;
    /// - [`EngineError::InvalidState`] when it is not engaged here.
    pub fn group_disengage(&mut self, group: GroupId) -> Result<(), EngineError> {
        self.scope_member(group)?;
        let pos = self
            .scope
            .engaged
            .iter()
            .position(|&g| g == group)
            .ok_or(EngineError::InvalidState)?;
        self.scope.engaged.remove(pos);
        let g = self.group_mut(group)?;
        debug_assert!(g.engaged_count > 0);
        g.engaged_count = g.engaged_count.saturating_sub(1);
        debug!(group = %group, "patch group disengaged");
        Ok(())
    }

    /// Orders `after_group` behind `before_group`: the after group's
    /// members cannot reach disk until every member of the before group
    /// has.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for groups outside the current scope;
    /// - [`EngineError::InvalidState`] when the state table forbids a new
    ///   before on `after_group`;
    /// - [`EngineError::Cycle`] when the group-of-groups graph would
    ///   become cyclic.
    pub fn group_add_depend(
        &mut self,
        after_group: GroupId,
        before_group: GroupId,
    ) -> Result<(), EngineError> {
        self.scope_member(after_group)?;
        self.scope_member(before_group)?;
        {
            let a = self.group(after_group)?;
            let allowed = if a.atomic {
                !a.released
            } else {
                !a.released && (!a.has_afters || a.wrote)
            };
            if !allowed {
                return Err(EngineError::InvalidState);
            }
        }
        let before_node = {
            let a = self.group(after_group)?;
            self.weak_get_key(a.before_node)
                .ok_or(EngineError::InternalCorruption("group before-node gone"))?
        };
        let after_node = {
            let b = self.group(before_group)?;
            self.weak_get_key(b.after_node)
                .ok_or(EngineError::InternalCorruption("group after-node gone"))?
        };
        self.add_depend(before_node, after_node)?;
        self.group_mut(after_group)?.has_befores = true;
        self.group_mut(before_group)?.has_afters = true;
        trace!(after = %after_group, before = %before_group, "group dependency added");
        Ok(())
    }

    /// Detaches the group from the current scope. When the last scope
    /// reference drops, the endpoint patches are unpinned and the group
    /// record lingers only until they are reclaimed.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for a group outside the current scope;
    /// - [`EngineError::InvalidState`] for an unreleased group, unless it
    ///   is hidden and not atomic (atomic groups must always be released
    ///   first; their implied hidden bit grants no shortcut past the
    ///   commit gate).
    pub fn group_abandon(&mut self, group: GroupId) -> Result<(), EngineError> {
        self.scope_member(group)?;
        {
            let g = self.group(group)?;
            let allowed = if g.atomic {
                g.released
            } else {
                g.released || g.hidden
            };
            if !allowed {
                return Err(EngineError::InvalidState);
            }
        }
        if let Some(pos) = self.scope.engaged.iter().position(|&g| g == group) {
            self.scope.engaged.remove(pos);
            let g = self.group_mut(group)?;
            g.engaged_count = g.engaged_count.saturating_sub(1);
        }
        self.scope.members.remove(&group);
        let last = {
            let g = self.group_mut(group)?;
            debug_assert!(g.refs > 0);
            g.refs = g.refs.saturating_sub(1);
            g.refs == 0
        };
        if last {
            self.group_retire(group)?;
        }
        debug!(group = %group, "patch group abandoned");
        Ok(())
    }

    fn group_retire(&mut self, group: GroupId) -> Result<(), EngineError> {
        let (before_key, after_key) = {
            let g = self.group_mut(group)?;
            g.abandoned = true;
            (g.before_node, g.after_node)
        };
        for key in [before_key, after_key] {
            let Some(patch) = self.weak_get_key(key) else {
                continue;
            };
            let eligible = match self.patches.get_mut(patch) {
                Some(p) => {
                    p.pinned = false;
                    if key == after_key {
                        // No more members can arrive; let the completion
                        // node satisfy once its befores drain.
                        p.held = false;
                    }
                    p.written && p.afters.is_empty()
                }
                None => false,
            };
            if eligible {
                self.enqueue_reclaim(patch);
            }
        }
        if let Some(after) = self.weak_get_key(after_key) {
            self.maybe_satisfy_empty(after);
        }
        self.zombie_groups.push(group);
        self.run_reclaim();
        Ok(())
    }

    /// Drops abandoned group records once both endpoint patches are gone.
    pub(crate) fn sweep_zombie_groups(&mut self) {
        if self.zombie_groups.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.zombie_groups);
        for group in pending {
            let done = match self.groups.get(&group) {
                Some(g) => {
                    g.abandoned
                        && self.weak_get_key(g.before_node).is_none()
                        && self.weak_get_key(g.after_node).is_none()
                }
                None => continue,
            };
            if done {
                if let Some(g) = self.groups.remove(&group) {
                    self.weak_release_key(g.before_node);
                    self.weak_release_key(g.after_node);
                }
                trace!(group = %group, "patch group reclaimed");
            } else {
                self.zombie_groups.push(group);
            }
        }
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Cooperatively drives `device` until everything reachable from the
    /// group's after-node is written.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] for a group outside the current scope;
    /// - [`EngineError::Busy`] when a flush round makes no progress while
    ///   the group is still incomplete (commonly: the group or one of its
    ///   befores was never released);
    /// - [`EngineError::IoFailed`] propagated from the device.
    pub fn group_sync<D: BlockDevice>(
        &mut self,
        device: &mut D,
        group: GroupId,
    ) -> Result<(), EngineError> {
        self.scope_member(group)?;
        loop {
            if self.group_complete(group)? {
                return Ok(());
            }
            match device.flush(self, FlushTarget::All)? {
                FlushProgress::Progress => {}
                FlushProgress::Empty | FlushProgress::Stalled => {
                    return if self.group_complete(group)? {
                        Ok(())
                    } else {
                        Err(EngineError::Busy)
                    };
                }
            }
        }
    }

    /// Returns `true` once every patch reachable from the group's
    /// after-node is written.
    ///
    /// The after-node itself is held until the group is abandoned (more
    /// members could still arrive), so completion is read off its drained
    /// befores rather than its own written bit.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown group.
    pub fn group_complete(&self, group: GroupId) -> Result<bool, EngineError> {
        let g = self.group(group)?;
        match self.weak_get_key(g.after_node) {
            None => Ok(true),
            Some(patch) => {
                let p = self.patch(patch)?;
                Ok(p.written || p.befores.is_empty())
            }
        }
    }

    /// Attaches a debug label to the group.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for a group outside the current scope.
    pub fn group_label(&mut self, group: GroupId, label: &str) -> Result<(), EngineError> {
        self.scope_member(group)?;
        self.group_mut(group)?.label = Some(label.to_owned());
        trace!(group = %group, label, "patch group labelled");
        Ok(())
    }

    /// Returns the group's debug label, if any.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown group.
    pub fn group_label_get(&self, group: GroupId) -> Result<Option<String>, EngineError> {
        Ok(self.group(group)?.label.clone())
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    /// Returns `true` while any group is engaged in the current scope.
    #[must_use]
    pub fn scope_engaged(&self) -> bool {
        !self.scope.engaged.is_empty()
    }

    /// Duplicates the current scope, sharing its groups (models `fork`).
    pub fn scope_copy(&mut self) -> Scope {
        let members = self.scope.members.clone();
        let engaged = self.scope.engaged.clone();
        for gid in &members {
            if let Some(g) = self.groups.get_mut(gid) {
                g.refs += 1;
            }
        }
        for gid in &engaged {
            if let Some(g) = self.groups.get_mut(gid) {
                g.engaged_count += 1;
            }
        }
        Scope { members, engaged }
    }

    /// Swaps `scope` in as the current scope, returning the previous one.
    pub fn scope_swap(&mut self, scope: Scope) -> Scope {
        std::mem::replace(&mut self.scope, scope)
    }

    /// Destroys a detached scope: disengages its engagements, drops its
    /// group references, and releases and retires any group it held the
    /// last reference to.
    pub fn scope_destroy(&mut self, scope: Scope) {
        for gid in &scope.engaged {
            if let Some(g) = self.groups.get_mut(gid) {
                g.engaged_count = g.engaged_count.saturating_sub(1);
            }
        }
        for gid in scope.members {
            let last = match self.groups.get_mut(&gid) {
                Some(g) => {
                    g.refs = g.refs.saturating_sub(1);
                    g.refs == 0
                }
                None => false,
            };
            if last {
                // The owning scope died without abandoning the group;
                // release it so its members are not stranded, then retire.
                let _ = self.group_release_inner(gid);
                let _ = self.group_retire(gid);
            }
        }
    }

    /// Resolved `(before_node, after_node)` pairs for the groups engaged
    /// in the current scope, in engagement order.
    pub(crate) fn engaged_nodes(&self) -> Vec<(PatchId, PatchId)> {
        let mut nodes = Vec::new();
        for gid in &self.scope.engaged {
            if let Some(g) = self.groups.get(gid) {
                if let (Some(before), Some(after)) = (
                    self.weak_get_key(g.before_node),
                    self.weak_get_key(g.after_node),
                ) {
                    nodes.push((before, after));
                }
            }
        }
        nodes
    }
}
