use std::fmt::{self, Debug};

use super::{CacheEntry, MapCache, OffloadError, OffloadInfo};
use crate::datamap::{AccessLevel, MapRef};
use crate::device::HostBuffer;
use crate::prelude::*;
use crate::types::{DeviceId, SeqId, Span};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum OffloadStage {
    Created,
    Mapped,
    Running,
    Finished,
}

/// The part of an offload that runs on one position. Owned by the shepherd of that position.
///
/// If the offload may contain nested offloads, the context's map cache is a frame of the
/// offload stack of its device while it lives, so those offloads can inherit its maps.
pub struct OffloadContext {
    info: Arc<OffloadInfo>,
    device: DeviceId,
    seqid: SeqId,
    stage: OffloadStage,
    cache: Arc<MapCache>,
    pushed: bool,
    finished: bool,
}

impl OffloadContext {
    /// Create the context of position `seqid`. Offloads that may contain nested offloads are
    /// pushed on the stack of their device.
    pub fn new(info: &Arc<OffloadInfo>, seqid: SeqId) -> Result<Self> {
        let nnodes = info.topology().nnodes();
        if seqid >= nnodes {
            return Err(OffloadError::InvalidPosition { seqid, nnodes }.into());
        }

        let device = info.topology().device(seqid);
        let capacity = info.registry().config().offload.map_cache_capacity;

        let mut this = Self {
            info: Arc::clone(info),
            device,
            seqid,
            stage: OffloadStage::Created,
            cache: Arc::new(MapCache::new(capacity)),
            pushed: false,
            finished: false,
        };

        if info.is_nested() {
            this.push()?;
        }

        Ok(this)
    }

    fn push(&mut self) -> Result {
        let stack = self.info.registry().device(self.device)?.stack();
        stack.push(self.device, Arc::clone(&self.cache))?;
        self.pushed = true;

        trace!(
            "offload {}: pushed on device {} (depth {})",
            self.info.name(),
            self.device,
            stack.len()
        );
        Ok(())
    }

    fn pop(&mut self) -> Result {
        if !take(&mut self.pushed) {
            return Ok(());
        }

        let stack = self.info.registry().device(self.device)?.stack();
        let frame = stack.pop(self.device)?;

        if !Arc::ptr_eq(&frame, &self.cache) {
            warn!(
                "offload {}: popped a frame of another offload from device {}",
                self.info.name(),
                self.device
            );
        }

        Ok(())
    }

    #[inline]
    pub fn info(&self) -> &Arc<OffloadInfo> {
        &self.info
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn seqid(&self) -> SeqId {
        self.seqid
    }

    #[inline]
    pub fn stage(&self) -> OffloadStage {
        self.stage
    }

    #[inline]
    pub fn cache(&self) -> &Arc<MapCache> {
        &self.cache
    }

    /// Advance to `stage`. Stages never go backwards.
    pub fn set_stage(&mut self, stage: OffloadStage) -> Result<(), OffloadError> {
        if stage < self.stage {
            return Err(OffloadError::InvalidStage {
                from: self.stage,
                to: stage,
            });
        }

        self.stage = stage;
        Ok(())
    }

    /// Search the caches of enclosing offloads on this device, innermost first.
    fn find_enclosing(&self, buffer: &HostBuffer) -> Result<Option<MapRef>> {
        let stack = self.info.registry().device(self.device)?.stack();

        for frame in stack.frames() {
            if Arc::ptr_eq(&frame, &self.cache) {
                continue;
            }

            if let Some((_, entry)) = frame.find(buffer) {
                return Ok(Some(entry.map));
            }
        }

        Ok(None)
    }

    /// Find the map of host array `buffer`.
    ///
    /// The search goes through, in order:
    /// 1. the own cache,
    /// 2. the map at index `hint` of this offload, if its source is `buffer` (any map if no
    ///    buffer is given),
    /// 3. all maps declared by this offload,
    /// 4. the caches of the enclosing offloads on this device, innermost first.
    ///
    /// Hits of steps 2 and 3 are cached as own maps, hits of step 4 as inherited. `None` if
    /// the array is mapped nowhere.
    pub fn lookup(
        &self,
        buffer: Option<&HostBuffer>,
        hint: Option<usize>,
    ) -> Result<Option<MapRef>> {
        if let Some((_, entry)) = buffer.and_then(|b| self.cache.find(b)) {
            return Ok(Some(entry.map));
        }

        let declared = hint
            .filter(|&index| match (self.info.maps().get(index), buffer) {
                (Some(info), Some(buffer)) => info.is_source(buffer),
                (Some(_), None) => true,
                (None, _) => false,
            })
            .or_else(|| buffer.and_then(|b| self.info.find_map(b)));

        if let Some(index) = declared {
            // without a buffer the cache has not been checked yet
            let source = self.info.map_info(index)?.source();
            if let Some((_, entry)) = self.cache.find(source) {
                return Ok(Some(entry.map));
            }

            let map = self.info.map_ref(index, self.seqid)?;
            self.cache.insert(map.clone(), false)?;
            return Ok(Some(map));
        }

        let buffer = match buffer {
            Some(buffer) => buffer,
            None => return Ok(None),
        };

        match self.find_enclosing(buffer)? {
            Some(map) => {
                trace!("offload {}: inherited {}", self.info.name(), map);
                self.cache.insert(map.clone(), true)?;
                Ok(Some(map))
            }
            None => Ok(None),
        }
    }

    pub fn cache_insert(&self, map: MapRef, inherited: bool) -> Result<usize, OffloadError> {
        self.cache.insert(map, inherited)
    }

    pub fn cached_maps(&self) -> Vec<CacheEntry> {
        self.cache.entries()
    }

    pub fn is_inherited(&self, map: &MapRef) -> bool {
        self.cache.is_inherited(map)
    }

    /// Next iterations of loop level `level` for this position.
    pub fn distribute_loop(&self, level: usize) -> Result<Span> {
        self.info.distribute_loop(level, self.seqid)
    }

    /// Iterations assigned by the last call to [`OffloadContext::distribute_loop`].
    pub fn loop_range(&self, level: usize) -> Option<Span> {
        self.info.loop_result(level, self.seqid).map(|r| r.span())
    }

    /// Map every array of the offload onto this position: arrays already mapped by an
    /// enclosing offload are inherited, the others are initialized, distributed, allocated
    /// and copied to the device.
    pub fn map_data(&mut self) -> Result {
        self.set_stage(OffloadStage::Mapped)?;

        for (index, info) in enumerate(self.info.maps()) {
            if let Some(map) = self.find_enclosing(info.source())? {
                debug!(
                    "offload {}: {} is inherited from {}",
                    self.info.name(),
                    info.symbol(),
                    map
                );
                self.cache.insert(map, true)?;
                continue;
            }

            let map = self.info.map_ref(index, self.seqid)?;
            map.init()?;
            map.distribute()?;
            map.setup_halo()?;
            map.allocate()?;
            map.copy_to_device()?;

            self.cache.insert(map, false)?;
        }

        Ok(())
    }

    /// Copy the own maps back to the host, release them, and leave the device stack.
    pub fn finish(&mut self) -> Result {
        self.set_stage(OffloadStage::Finished)?;

        for entry in self.cache.entries() {
            if entry.inherited {
                continue;
            }

            // maps found by `lookup` may never have been allocated
            if entry.map.level() == Some(AccessLevel::Malloc) {
                entry.map.copy_from_device()?;
            }
            entry.map.free()?;
        }

        self.finished = true;
        self.pop()
    }

    /// Free the own maps that are still allocated, without copying anything back.
    fn release(&self) {
        for entry in self.cache.entries() {
            if entry.inherited || entry.map.level() == Some(AccessLevel::Freed) {
                continue;
            }

            if let Err(e) = entry.map.free() {
                warn!(
                    "offload {}: failed to free {}: {:?}",
                    self.info.name(),
                    entry.map,
                    e
                );
            }
        }
    }
}

impl Drop for OffloadContext {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }

        if let Err(e) = self.pop() {
            error!("offload {}: {:?}", self.info.name(), e);
        }
    }
}

impl Debug for OffloadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadContext")
            .field("offload", &self.info.name())
            .field("device", &self.device)
            .field("seqid", &self.seqid)
            .field("stage", &self.stage)
            .field("cache", &self.cache)
            .finish()
    }
}
