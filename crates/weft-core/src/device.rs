// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Block-device contract.
//!
//! Devices are external collaborators: the engine never performs I/O
//! itself. A device registers a [`DeviceInfo`] record to obtain its
//! [`DevId`], which names its level (write-ordering position) and graph
//! index (ownership bucket), and implements [`BlockDevice`] for the
//! read/write/flush surface. Devices call the revision protocol
//! ([`Engine::revision_prepare`] / acknowledge / revert) around their
//! writes.
//!
//! Each device record also carries a *write head*: a per-device slot
//! holding the default head patch for work the device originates. The
//! slot is a weak reference, so a head that is merged away follows its
//! survivor and a reclaimed head reads back as `None`.

use crate::engine::{Engine, EngineError};
use crate::constants::{NBDINDEX, NBDLEVEL};
use crate::ident::{BdescId, DevId, GraphIndex, Level, PatchId, WeakKey};

/// Registration record for a block device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name, for logs and labels.
    pub name: String,
    /// Write-ordering level; see [`Level`].
    pub level: Level,
    /// Ownership bucket; see [`GraphIndex`].
    pub graph_index: GraphIndex,
    /// Block size in bytes.
    pub blocksize: u32,
    /// Number of blocks the device exposes.
    pub numblocks: u32,
    /// Largest write the device performs atomically, in bytes.
    pub atomicsize: u32,
}

#[derive(Debug)]
pub(crate) struct DeviceRecord {
    pub(crate) info: DeviceInfo,
    pub(crate) write_head: Option<WeakKey>,
    pub(crate) block_space: i32,
}

/// What a flush call should try to push to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    /// Every dirty block the device tracks.
    All,
    /// One block by number.
    Block(u32),
    /// Whatever is needed to get one patch written.
    Patch(PatchId),
}

/// Outcome of one flush round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushProgress {
    /// Nothing was dirty.
    Empty,
    /// At least one ready patch reached the device.
    Progress,
    /// Dirty blocks remain but none could make progress (their patches
    /// are blocked on work elsewhere).
    Stalled,
}

/// Result of a synthetic read: the descriptor plus whether its bytes are
/// still unbacked by a real read.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticBlock {
    /// The descriptor, autoreleased like any read result.
    pub block: BdescId,
    /// `true` until the caller fills the bytes or a real read happens.
    pub synthetic: bool,
}

/// The device surface the engine's collaborators implement.
///
/// All methods thread the engine handle explicitly; devices own no engine
/// state beyond their [`DevId`]. Read results are returned autoreleased,
/// so callers inside an autorelease pool need no explicit release.
pub trait BlockDevice {
    /// The device's registration id.
    fn dev_id(&self) -> DevId;

    /// Reads a block, returning an autoreleased descriptor.
    ///
    /// # Errors
    /// Device-specific; [`EngineError::InvalidOffset`] for an
    /// out-of-range block number.
    fn read_block(&mut self, engine: &mut Engine, number: u32)
        -> Result<BdescId, EngineError>;

    /// Returns a descriptor whose bytes the caller may fill without a
    /// disk read (used when the caller will overwrite the whole block).
    ///
    /// # Errors
    /// As [`BlockDevice::read_block`].
    fn synthetic_read_block(
        &mut self,
        engine: &mut Engine,
        number: u32,
    ) -> Result<SyntheticBlock, EngineError>;

    /// Writes a block through the revision protocol. The image that
    /// reaches the medium is the revision slice at this device's level;
    /// rolled-back patches stay in memory for a later write.
    ///
    /// # Errors
    /// [`EngineError::IoFailed`] when the medium rejects the write (the
    /// engine state is reverted and the patches remain eligible).
    fn write_block(
        &mut self,
        engine: &mut Engine,
        block: BdescId,
        number: u32,
    ) -> Result<(), EngineError>;

    /// Pushes dirty state toward the medium; one cooperative round.
    ///
    /// # Errors
    /// [`EngineError::IoFailed`] as for [`BlockDevice::write_block`].
    fn flush(
        &mut self,
        engine: &mut Engine,
        target: FlushTarget,
    ) -> Result<FlushProgress, EngineError>;
}

impl Engine {
    /// Registers a block device record and issues its [`DevId`].
    ///
    /// # Errors
    /// - [`EngineError::InvalidLevel`] when the level or graph index is
    ///   out of range, or another registered device already owns the
    ///   graph index;
    /// - [`EngineError::InvalidState`] for a zero block size.
    pub fn register_device(&mut self, info: DeviceInfo) -> Result<DevId, EngineError> {
        if (info.level.raw() as usize) >= NBDLEVEL
            || (info.graph_index.raw() as usize) >= NBDINDEX
        {
            return Err(EngineError::InvalidLevel);
        }
        if self
            .devices
            .iter()
            .any(|d| d.info.graph_index == info.graph_index)
        {
            return Err(EngineError::InvalidLevel);
        }
        if info.blocksize == 0 {
            return Err(EngineError::InvalidState);
        }
        let id = DevId(self.devices.len() as u32);
        self.devices.push(DeviceRecord {
            info,
            write_head: None,
            block_space: 0,
        });
        Ok(id)
    }

    /// Returns a copy of the device's registration record.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown device.
    pub fn device_info(&self, dev: DevId) -> Result<DeviceInfo, EngineError> {
        Ok(self.device(dev)?.info.clone())
    }

    /// Reads the device's write head: the default head patch for work
    /// this device originates. A head that was merged away resolves to
    /// its survivor; a reclaimed head resolves to `None`.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown device.
    pub fn write_head(&self, dev: DevId) -> Result<Option<PatchId>, EngineError> {
        let record = self.device(dev)?;
        Ok(record.write_head.and_then(|key| self.weak_get_key(key)))
    }

    /// Replaces the device's write head.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown device or a stale head.
    pub fn set_write_head(
        &mut self,
        dev: DevId,
        head: Option<PatchId>,
    ) -> Result<(), EngineError> {
        self.device(dev)?;
        let new_key = match head {
            Some(patch) => Some(self.weak_retain_key(patch)?),
            None => None,
        };
        let old = {
            let record = self.device_mut(dev)?;
            std::mem::replace(&mut record.write_head, new_key)
        };
        if let Some(key) = old {
            self.weak_release_key(key);
        }
        Ok(())
    }

    /// Advisory free-space hint used by admission control above the
    /// device.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown device.
    pub fn block_space_hint(&self, dev: DevId) -> Result<i32, EngineError> {
        Ok(self.device(dev)?.block_space)
    }

    /// Updates the advisory free-space hint.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown device.
    pub fn set_block_space_hint(&mut self, dev: DevId, space: i32) -> Result<(), EngineError> {
        self.device_mut(dev)?.block_space = space;
        Ok(())
    }
}
