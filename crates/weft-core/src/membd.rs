// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory reference block device.
//!
//! Backs its "disk" with a flat byte buffer and drives the revision
//! protocol the way any real driver would: prepare a slice, copy the
//! image to the medium, acknowledge — or revert when the medium rejects
//! the write. Fault injection (`fail_next_writes`) exercises the revert
//! path, and `crash` discards all volatile state while keeping the disk
//! bytes, which is how the tests observe what an interrupted run would
//! leave behind.
//!
//! The device holds no strong references: its block cache stores raw ids
//! and revalidates them by generation, re-reading from the disk buffer
//! when a descriptor has been freed under it.

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use tracing::trace;

use crate::device::{BlockDevice, DeviceInfo, FlushProgress, FlushTarget, SyntheticBlock};
use crate::engine::{Engine, EngineError};
use crate::ident::{BdescId, DevId, GraphIndex, Level};

/// An in-memory block device.
#[derive(Debug)]
pub struct MemDevice {
    dev: DevId,
    blocksize: u32,
    numblocks: u32,
    storage: Box<[u8]>,
    cache: FxHashMap<u32, BdescId>,
    dirty: BTreeSet<u32>,
    fail_writes: u32,
}

impl MemDevice {
    /// Creates and registers an in-memory device with zero-filled disk
    /// contents.
    ///
    /// # Errors
    /// Propagates [`Engine::register_device`] failures;
    /// [`EngineError::InvalidOffset`] for a zero-sized geometry.
    pub fn new(
        engine: &mut Engine,
        name: &str,
        blocksize: u32,
        numblocks: u32,
        level: Level,
        graph_index: GraphIndex,
    ) -> Result<Self, EngineError> {
        let bytes = (blocksize as usize)
            .checked_mul(numblocks as usize)
            .ok_or(EngineError::InvalidOffset)?;
        if bytes == 0 {
            return Err(EngineError::InvalidOffset);
        }
        let dev = engine.register_device(DeviceInfo {
            name: name.to_owned(),
            level,
            graph_index,
            blocksize,
            numblocks,
            atomicsize: blocksize,
        })?;
        engine.set_block_space_hint(dev, numblocks as i32)?;
        Ok(Self {
            dev,
            blocksize,
            numblocks,
            storage: vec![0u8; bytes].into_boxed_slice(),
            cache: FxHashMap::default(),
            dirty: BTreeSet::new(),
            fail_writes: 0,
        })
    }

    /// Makes the next `count` medium writes fail with
    /// [`EngineError::IoFailed`].
    pub fn fail_next_writes(&mut self, count: u32) {
        self.fail_writes = count;
    }

    /// Returns the on-disk bytes of one block.
    #[must_use]
    pub fn disk_block(&self, number: u32) -> &[u8] {
        let at = (number * self.blocksize) as usize;
        &self.storage[at..at + self.blocksize as usize]
    }

    /// Simulates a crash: consumes the device, discarding every volatile
    /// structure, and returns the raw disk bytes as they stood.
    #[must_use]
    pub fn crash(self) -> Box<[u8]> {
        self.storage
    }

    /// Number of blocks still tracked as dirty.
    #[must_use]
    pub fn dirty_blocks(&self) -> usize {
        self.dirty.len()
    }

    fn check_number(&self, number: u32) -> Result<(), EngineError> {
        if number >= self.numblocks {
            return Err(EngineError::InvalidOffset);
        }
        Ok(())
    }

    fn cached(&mut self, engine: &Engine, number: u32) -> Option<BdescId> {
        match self.cache.get(&number) {
            Some(&id) if engine.bdesc_alive(id) => Some(id),
            Some(_) => {
                self.cache.remove(&number);
                self.dirty.remove(&number);
                None
            }
            None => None,
        }
    }

    fn storage_range(&self, number: u32) -> std::ops::Range<usize> {
        let at = (number * self.blocksize) as usize;
        at..at + self.blocksize as usize
    }

    /// One flush round over a set of block numbers. Writes every block
    /// with at least one ready patch at this device's level.
    fn flush_round(
        &mut self,
        engine: &mut Engine,
        numbers: &[u32],
    ) -> Result<FlushProgress, EngineError> {
        if numbers.is_empty() {
            return Ok(FlushProgress::Empty);
        }
        let mut wrote = false;
        let mut remaining = false;
        for &number in numbers {
            let Some(block) = self.cached(engine, number) else {
                self.dirty.remove(&number);
                continue;
            };
            if engine.live_patch_count(block)? == 0 {
                self.dirty.remove(&number);
                continue;
            }
            if engine.ready_patch_count(block, self.dev)? == 0 {
                remaining = true;
                continue;
            }
            self.write_block(engine, block, number)?;
            wrote = true;
            if engine.live_patch_count(block)? > 0 {
                remaining = true;
            }
        }
        if wrote {
            Ok(FlushProgress::Progress)
        } else if remaining {
            Ok(FlushProgress::Stalled)
        } else {
            Ok(FlushProgress::Empty)
        }
    }
}

impl BlockDevice for MemDevice {
    fn dev_id(&self) -> DevId {
        self.dev
    }

    fn read_block(
        &mut self,
        engine: &mut Engine,
        number: u32,
    ) -> Result<BdescId, EngineError> {
        self.check_number(number)?;
        if let Some(block) = self.cached(engine, number) {
            engine.bdesc_retain(block)?;
            engine.bdesc_autorelease(block)?;
            return Ok(block);
        }
        let block = engine.bdesc_alloc(number, self.blocksize, 1)?;
        engine.bdesc_fill(block, &self.storage[self.storage_range(number)])?;
        engine.bdesc_autorelease(block)?;
        self.cache.insert(number, block);
        trace!(%block, number, "mem device read");
        Ok(block)
    }

    fn synthetic_read_block(
        &mut self,
        engine: &mut Engine,
        number: u32,
    ) -> Result<SyntheticBlock, EngineError> {
        self.check_number(number)?;
        if let Some(block) = self.cached(engine, number) {
            engine.bdesc_retain(block)?;
            engine.bdesc_autorelease(block)?;
            return Ok(SyntheticBlock {
                block,
                synthetic: engine.bdesc_is_synthetic(block)?,
            });
        }
        let block = engine.bdesc_alloc(number, self.blocksize, 1)?;
        engine.bdesc_set_synthetic(block, true)?;
        engine.bdesc_autorelease(block)?;
        self.cache.insert(number, block);
        trace!(%block, number, "mem device synthetic read");
        Ok(SyntheticBlock {
            block,
            synthetic: true,
        })
    }

    fn write_block(
        &mut self,
        engine: &mut Engine,
        block: BdescId,
        number: u32,
    ) -> Result<(), EngineError> {
        self.check_number(number)?;
        if engine.bdesc_length(block)? != self.blocksize {
            return Err(EngineError::InvalidOffset);
        }
        self.cache.insert(number, block);
        let slice = engine.revision_prepare(block, self.dev)?;
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            engine.revision_revert(block, self.dev)?;
            self.dirty.insert(number);
            return Err(EngineError::IoFailed);
        }
        let range = self.storage_range(number);
        self.storage[range].copy_from_slice(engine.bdesc_data(block)?);
        engine.revision_acknowledge(block, self.dev)?;
        trace!(%block, number, ready = slice.ready, "mem device write");
        if engine.bdesc_alive(block) && engine.live_patch_count(block)? > 0 {
            self.dirty.insert(number);
        } else {
            self.dirty.remove(&number);
        }
        Ok(())
    }

    fn flush(
        &mut self,
        engine: &mut Engine,
        target: FlushTarget,
    ) -> Result<FlushProgress, EngineError> {
        match target {
            FlushTarget::All => {
                let numbers: Vec<u32> = self.dirty.iter().copied().collect();
                self.flush_round(engine, &numbers)
            }
            FlushTarget::Block(number) => {
                let numbers: Vec<u32> = self.dirty.contains(&number).then_some(number).into_iter().collect();
                self.flush_round(engine, &numbers)
            }
            FlushTarget::Patch(patch) => {
                if !engine.patch_alive(patch) || engine.patch_written(patch)? {
                    return Ok(FlushProgress::Empty);
                }
                let numbers: Vec<u32> = self.dirty.iter().copied().collect();
                self.flush_round(engine, &numbers)
            }
        }
    }
}
