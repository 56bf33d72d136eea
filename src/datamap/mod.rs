//! Mapping of host arrays onto the devices of a topology.
//!
//! A [`DataMapInfo`] describes one array and how it is distributed. When the owning offload is
//! built, it receives one [`DataMap`] per grid position. The shepherd of a position drives its
//! map through the levels `Init -> Dist -> Halo -> Malloc` using a [`MapRef`]. Other
//! shepherds may read a map once it has published the level they need, see
//! [`DataMap::wait_for`].
mod halo;
mod map_ref;
mod marshal;

pub use halo::{HaloBufferSet, HaloError, PullDirection, Relay, Side, Window};
pub use map_ref::MapRef;

use by_address::ByAddress;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::device::{HostBuffer, HostRegion, MemRegion};
use crate::distribution::{Alignee, DistResult, DistSpec};
use crate::prelude::*;
use crate::types::{DeviceId, SeqId, MAX_DIMS};

#[derive(Error, Debug)]
pub enum MapError {
    #[error("arrays must have between 1 and {} dimensions, got {0}", MAX_DIMS)]
    InvalidRank(usize),

    #[error("dimension {dim} is out of range for {symbol:?} with {ndims} dimensions")]
    InvalidDim {
        symbol: String,
        dim: usize,
        ndims: usize,
    },

    #[error("source of {symbol:?} holds {actual} bytes but {expected} bytes are required")]
    SourceTooSmall {
        symbol: String,
        expected: usize,
        actual: usize,
    },

    #[error("{symbol:?} on position {seqid} must reach {required} first, but it is at {current:?}")]
    InvalidTransition {
        symbol: String,
        seqid: SeqId,
        required: AccessLevel,
        current: Option<AccessLevel>,
    },

    #[error("timed out waiting for {symbol:?} on position {seqid} to reach {level}")]
    NotReady {
        symbol: String,
        seqid: SeqId,
        level: AccessLevel,
    },

    #[error("{symbol:?} on position {seqid} has not been marshalled")]
    NotMarshalled { symbol: String, seqid: SeqId },

    #[error("{symbol:?} has no map for position {seqid}")]
    UnknownPosition { symbol: String, seqid: SeqId },
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MapDirection {
    To,
    From,
    ToFrom,
    /// Only allocate, never copy.
    Alloc,
}

impl MapDirection {
    pub fn copies_to(&self) -> bool {
        matches!(self, MapDirection::To | MapDirection::ToFrom)
    }

    pub fn copies_from(&self) -> bool {
        matches!(self, MapDirection::From | MapDirection::ToFrom)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MapType {
    /// Decided by the memory of the device.
    Auto,
    /// The device accesses host memory directly.
    Shared,
    /// The device works on its own copy.
    Copy,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Edging {
    None,
    Reflecting,
    Periodic,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct HaloSpec {
    pub left: u64,
    pub right: u64,
    pub edging: Edging,
}

/// Readiness of a [`DataMap`]. Levels only ever increase, except that a redistribution
/// takes a map back to `Dist`.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum AccessLevel {
    /// The map type has been resolved.
    Init = 1,
    /// The sub-region is known.
    Dist = 2,
    /// Halo windows, neighbors, and relays are set up.
    Halo = 3,
    /// The device buffer exists.
    Malloc = 4,
    Freed = 5,
}

impl AccessLevel {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => AccessLevel::Init,
            2 => AccessLevel::Dist,
            3 => AccessLevel::Halo,
            4 => AccessLevel::Malloc,
            5 => AccessLevel::Freed,
            _ => return None,
        })
    }
}

impl Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessLevel::Init => "INIT",
            AccessLevel::Dist => "DIST",
            AccessLevel::Halo => "HALO",
            AccessLevel::Malloc => "MALLOC",
            AccessLevel::Freed => "FREED",
        };

        f.write_str(name)
    }
}

/// Description of a host array and its distribution, shared by all positions of an offload.
#[derive(Debug)]
pub struct DataMapInfo {
    symbol: String,
    source: ByAddress<HostBuffer>,
    dims: DimVec<u64>,
    elem_size: usize,
    direction: MapDirection,
    map_type: MapType,
    dist: DimVec<DistSpec>,
    halo: DimVec<Option<HaloSpec>>,
    maps: Vec<DataMap>,
}

impl DataMapInfo {
    /// Describe the array `source` of the given extents. Initially every dimension is fully
    /// replicated on all positions.
    pub fn new(
        symbol: impl Into<String>,
        source: HostBuffer,
        dims: &[u64],
        elem_size: usize,
        direction: MapDirection,
        map_type: MapType,
    ) -> Result<Self, MapError> {
        let symbol = symbol.into();

        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(MapError::InvalidRank(dims.len()));
        }

        let expected = dims.iter().product::<u64>() as usize * elem_size;
        let actual = source.len();
        if actual < expected {
            return Err(MapError::SourceTooSmall {
                symbol,
                expected,
                actual,
            });
        }

        Ok(Self {
            symbol,
            source: ByAddress(source),
            dims: dims.iter().copied().collect(),
            elem_size,
            direction,
            map_type,
            dist: dims.iter().map(|&n| DistSpec::full(0..n)).collect(),
            halo: dims.iter().map(|_| None).collect(),
            maps: vec![],
        })
    }

    fn check_dim(&self, dim: usize) -> Result<(), MapError> {
        if dim < self.ndims() {
            Ok(())
        } else {
            Err(MapError::InvalidDim {
                symbol: self.symbol.clone(),
                dim,
                ndims: self.ndims(),
            })
        }
    }

    /// Distribute dimension `dim` according to `spec`.
    pub fn dist_init(mut self, dim: usize, spec: DistSpec) -> Result<Self, MapError> {
        self.check_dim(dim)?;
        self.dist[dim] = spec;
        Ok(self)
    }

    /// Align dimension `dim` with `alignee`, keeping the grid axis of the current distribution.
    pub fn align(mut self, dim: usize, alignee: Alignee) -> Result<Self, MapError> {
        self.check_dim(dim)?;

        let axis = self.dist[dim].target_axis();
        self.dist[dim] = DistSpec::aligned(0..self.dims[dim], alignee).axis(axis);
        Ok(self)
    }

    pub fn add_halo(
        mut self,
        dim: usize,
        left: u64,
        right: u64,
        edging: Edging,
    ) -> Result<Self, MapError> {
        self.check_dim(dim)?;
        self.halo[dim] = Some(HaloSpec {
            left,
            right,
            edging,
        });

        Ok(self)
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[inline]
    pub fn source(&self) -> &HostBuffer {
        &self.source
    }

    pub fn is_source(&self, buffer: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.source, buffer)
    }

    #[inline]
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn direction(&self) -> MapDirection {
        self.direction
    }

    #[inline]
    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    #[inline]
    pub fn dist(&self, dim: usize) -> &DistSpec {
        &self.dist[dim]
    }

    pub fn dists(&self) -> &[DistSpec] {
        &self.dist
    }

    pub(crate) fn dists_mut(&mut self) -> &mut [DistSpec] {
        &mut self.dist
    }

    #[inline]
    pub fn halo(&self, dim: usize) -> Option<&HaloSpec> {
        self.halo.get(dim).and_then(|h| h.as_ref())
    }

    pub fn has_halo(&self) -> bool {
        any(&self.halo, |h| h.is_some())
    }

    /// Bytes of one row of dimension `dim`, i.e. the element size times the extents of all
    /// inner dimensions.
    pub fn row_size(&self, dim: usize) -> usize {
        self.elem_size * self.dims[dim + 1..].iter().product::<u64>() as usize
    }

    /// Create the per-position maps, one for each device of the topology.
    pub(crate) fn attach(&mut self, devices: &[DeviceId]) {
        self.maps = devices.iter().map(|&d| DataMap::new(d)).collect();
    }

    pub fn map(&self, seqid: SeqId) -> Result<&DataMap, MapError> {
        self.maps.get(seqid).ok_or_else(|| MapError::UnknownPosition {
            symbol: self.symbol.clone(),
            seqid,
        })
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }
}

impl Display for DataMapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} ({} bytes/elem, {:?}, {:?}):",
            self.symbol,
            self.dims.as_slice(),
            self.elem_size,
            self.direction,
            self.map_type
        )?;

        for (dim, (dist, halo)) in enumerate(zip(&self.dist, &self.halo)) {
            write!(f, " [{}: {}", dim, dist)?;
            if let Some(h) = halo {
                write!(f, ", halo {}/{} {:?}", h.left, h.right, h.edging)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

/// State of one array on one position. Written only by the shepherd of that position.
#[derive(Debug, Default)]
pub(crate) struct MapState {
    pub(crate) map_type: Option<MapType>,
    pub(crate) dist: DimVec<DistResult>,
    pub(crate) noncontiguous: bool,
    /// Number of elements of the sub-region along each dimension.
    pub(crate) map_dims: DimVec<u64>,
    /// Size in bytes of the sub-region.
    pub(crate) map_size: usize,
    /// Sub-region in host memory (only for contiguous maps).
    pub(crate) host: Option<HostRegion>,
    /// Sub-region plus the halo rows that exist in host memory.
    pub(crate) host_wextra: Option<HostRegion>,
    /// Offset of `host_wextra` inside the device buffer with extra space.
    pub(crate) host_wextra_offset: usize,
    pub(crate) device: Option<MemRegion>,
    pub(crate) device_wextra: Option<MemRegion>,
    pub(crate) owns_buffer: bool,
    pub(crate) halo: DimVec<Option<HaloBufferSet>>,
    pub(crate) marshalled: Option<HostBuffer>,
}

impl MapState {
    pub(crate) fn halo_rows(&self) -> (u64, u64) {
        match self.halo.first() {
            Some(Some(h)) => (h.left, h.right),
            _ => (0, 0),
        }
    }
}

/// One array on one position of the topology.
#[derive(Debug)]
pub struct DataMap {
    device: DeviceId,
    level: AtomicU8,
    level_lock: Mutex<()>,
    level_changed: Condvar,
    state: RwLock<MapState>,
}

impl DataMap {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            level: AtomicU8::new(0),
            level_lock: Mutex::new(()),
            level_changed: Condvar::new(),
            state: default(),
        }
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Current level, or `None` if the map has not been initialized.
    pub fn level(&self) -> Option<AccessLevel> {
        AccessLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    pub fn reached(&self, level: AccessLevel) -> bool {
        self.level.load(Ordering::Acquire) >= level as u8
    }

    /// Raise the level to `level`. Everything written to the state before this call is visible
    /// to readers that observe the new level.
    pub(crate) fn publish(&self, level: AccessLevel) {
        let _guard = self.level_lock.lock();
        self.level.fetch_max(level as u8, Ordering::Release);
        self.level_changed.notify_all();
    }

    /// Lower the level to `level` before the state published by higher levels is rebuilt.
    /// Only a redistribution does this.
    pub(crate) fn retreat(&self, level: AccessLevel) {
        let _guard = self.level_lock.lock();
        self.level.fetch_min(level as u8, Ordering::Release);
    }

    /// Block until the map reaches `level`, or fail once `timeout` has passed.
    pub fn wait_for(&self, level: AccessLevel, timeout: Duration) -> Result<(), Duration> {
        if self.reached(level) {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.level_lock.lock();

        while !self.reached(level) {
            if self
                .level_changed
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return if self.reached(level) {
                    Ok(())
                } else {
                    Err(timeout)
                };
            }
        }

        Ok(())
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, MapState> {
        self.state.read()
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, MapState> {
        self.state.write()
    }

    /// Distribution results, one per dimension.
    pub fn dist_results(&self) -> DimVec<DistResult> {
        self.state().dist.clone()
    }

    pub fn resolved_type(&self) -> Option<MapType> {
        self.state().map_type
    }

    pub fn is_noncontiguous(&self) -> bool {
        self.state().noncontiguous
    }

    /// Size in bytes of the sub-region.
    pub fn map_size(&self) -> usize {
        self.state().map_size
    }

    /// The sub-region as seen by the device.
    pub fn device_region(&self) -> Option<MemRegion> {
        self.state().device.clone()
    }

    /// The device buffer including the halo windows.
    pub fn device_region_wextra(&self) -> Option<MemRegion> {
        self.state().device_wextra.clone()
    }

    pub fn halo_set(&self, dim: usize) -> Option<HaloBufferSet> {
        self.state().halo.get(dim).cloned().flatten()
    }
}

impl Display for DataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        match self.level() {
            Some(level) => write!(f, "device {} at {}", self.device, level)?,
            None => write!(f, "device {} uninitialized", self.device)?,
        }

        if let Some(map_type) = state.map_type {
            write!(f, ", {:?}", map_type)?;
        }

        for result in &state.dist {
            write!(f, " {}", result.span())?;
        }

        write!(f, ", {} bytes", state.map_size)?;
        if state.noncontiguous {
            write!(f, " (noncontiguous)")?;
        }

        Ok(())
    }
}
