use std::fmt::{self, Debug, Display};

use super::{AccessLevel, DataMap, DataMapInfo, MapError, MapState, MapType};
use crate::device::{DeviceRegistry, HostArray, HostRegion, MemRegion, StreamId};
use crate::distribution::DistResult;
use crate::offload::OffloadInfo;
use crate::prelude::*;
use crate::types::{DeviceId, SeqId};
use shepherd_core::util::product;

/// Handle to the map of one array on one position of an offload.
///
/// The shepherd of the position is the only one that advances the map; the methods that do so
/// must not be called concurrently for the same position.
#[derive(Clone)]
pub struct MapRef {
    offload: Arc<OffloadInfo>,
    index: usize,
    seqid: SeqId,
}

/// Row-major offset in elements of the first element of a sub-region.
pub(crate) fn element_offset(dims: &[u64], results: &[DistResult]) -> u64 {
    zip(dims, results).fold(0, |acc, (&n, r)| acc * n + r.offset)
}

/// A sub-region is contiguous in row-major order iff every dimension outside the innermost
/// partially covered one has at most one element.
pub(crate) fn is_contiguous(dims: &[u64], map_dims: &[u64]) -> bool {
    if map_dims.contains(&0) {
        return true;
    }

    match (0..dims.len()).rev().find(|&i| map_dims[i] < dims[i]) {
        Some(j) => map_dims[..j].iter().all(|&n| n <= 1),
        None => true,
    }
}

impl MapRef {
    pub(crate) fn new(offload: Arc<OffloadInfo>, index: usize, seqid: SeqId) -> Self {
        Self {
            offload,
            index,
            seqid,
        }
    }

    #[inline]
    pub fn offload(&self) -> &Arc<OffloadInfo> {
        &self.offload
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn seqid(&self) -> SeqId {
        self.seqid
    }

    #[inline]
    pub fn info(&self) -> &DataMapInfo {
        &self.offload.maps()[self.index]
    }

    #[inline]
    pub fn map(&self) -> &DataMap {
        &self.info().maps[self.seqid]
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.map().device()
    }

    pub fn level(&self) -> Option<AccessLevel> {
        self.map().level()
    }

    fn registry(&self) -> &DeviceRegistry {
        self.offload.registry()
    }

    pub(super) fn require(&self, level: AccessLevel) -> Result<(), MapError> {
        if self.map().reached(level) {
            Ok(())
        } else {
            Err(MapError::InvalidTransition {
                symbol: self.info().symbol().to_string(),
                seqid: self.seqid,
                required: level,
                current: self.level(),
            })
        }
    }

    /// Resolve the map type for the device of this position.
    pub fn init(&self) -> Result {
        let info = self.info();
        let map = self.map();
        let discrete = self.registry().device(map.device())?.memory().is_discrete();

        let map_type = match info.map_type() {
            MapType::Auto if discrete => MapType::Copy,
            MapType::Auto => MapType::Shared,
            MapType::Shared if discrete => {
                warn!(
                    "{}: device {} has discrete memory, mapping as COPY instead of SHARED",
                    info.symbol(),
                    map.device()
                );
                MapType::Copy
            }
            other => other,
        };

        map.state_mut().map_type = Some(map_type);
        map.publish(AccessLevel::Init);

        trace!("{}: initialized as {:?}", self, map_type);
        Ok(())
    }

    /// Apply the distribution of every dimension and compute the resulting sub-region. Returns
    /// the number of elements assigned to this position.
    ///
    /// A map that has been distributed before is only distributed again if one of its
    /// dimensions requires redistribution. The map then falls back to [`AccessLevel::Dist`]:
    /// its halo windows and device region are dropped and have to be set up again with
    /// [`MapRef::setup_halo`] and [`MapRef::allocate`]. An owned device buffer is kept for
    /// `allocate` to reuse.
    pub fn distribute(&self) -> Result<u64> {
        self.require(AccessLevel::Init)?;

        let info = self.info();
        let map = self.map();

        if map.reached(AccessLevel::Dist) && !any(info.dists(), |d| d.needs_redistribution()) {
            return Ok(product(&map.state().map_dims));
        }

        if map.reached(AccessLevel::Halo) {
            map.retreat(AccessLevel::Dist);

            let mut state = map.state_mut();
            for set in state.halo.iter().flatten() {
                set.cancel_relays();
            }

            state.halo.clear();
            state.device = None;
            if !state.owns_buffer {
                state.device_wextra = None;
            }
            state.marshalled = None;
        }

        let prev = map.dist_results();
        let mut results = DimVec::new();

        for (dim, spec) in enumerate(info.dists()) {
            let pos = self.offload.position(self.seqid, spec.target_axis());
            let last = prev.get(dim).copied().unwrap_or_default();

            let result = spec
                .apply(pos, &last, |alignee| {
                    self.offload.resolve_alignee(alignee, self.seqid, 0)
                })
                .with_context(|| {
                    format!(
                        "failed to distribute dimension {} of {} on position {}",
                        dim,
                        info.symbol(),
                        self.seqid
                    )
                })?;

            results.push(result);
        }

        let map_dims: DimVec<u64> = results.iter().map(|r| r.length).collect();
        let elements = product(&map_dims);
        let map_size = elements as usize * info.elem_size();
        let noncontiguous = !is_contiguous(info.dims(), &map_dims);

        let host = if noncontiguous {
            None
        } else {
            let offset = element_offset(info.dims(), &results) as usize * info.elem_size();
            Some(HostRegion::new(Arc::clone(info.source()), offset, map_size)?)
        };

        {
            let mut state = map.state_mut();
            state.dist = results;
            state.map_dims = map_dims;
            state.map_size = map_size;
            state.noncontiguous = noncontiguous;
            state.host_wextra = host.clone();
            state.host_wextra_offset = 0;
            state.host = host;
        }

        map.publish(AccessLevel::Dist);

        debug!(
            "{}: {} elements ({} bytes){}",
            self,
            elements,
            map_size,
            if noncontiguous { ", non-contiguous" } else { "" }
        );

        Ok(elements)
    }

    /// Lay out the halo windows, find the neighbors and set up relays where needed. Does
    /// nothing for maps without a halo.
    pub fn setup_halo(&self) -> Result {
        self.require(AccessLevel::Dist)?;

        let info = self.info();
        if !info.has_halo() {
            return Ok(());
        }

        let map = self.map();
        let (noncontiguous, map_size, dist0) = {
            let state = map.state();
            (state.noncontiguous, state.map_size, state.dist[0])
        };

        let mut sets = DimVec::new();
        for dim in 0..info.ndims() {
            let spec = match info.halo(dim) {
                Some(spec) => spec,
                None => {
                    sets.push(None);
                    continue;
                }
            };

            if dim != 0 {
                warn!(
                    "{}: halo along dimension {} is not supported, ignored",
                    self, dim
                );
                sets.push(None);
            } else if noncontiguous {
                warn!("{}: halo of a non-contiguous map is not supported, ignored", self);
                sets.push(None);
            } else {
                if dist0.length < max(spec.left, spec.right) {
                    warn!(
                        "{}: {} rows are fewer than the halo width {}/{}",
                        self, dist0.length, spec.left, spec.right
                    );
                }

                sets.push(Some(self.build_halo_set(spec, map_size)));
            }
        }

        // Rows of the halo that exist in the host array. Rows outside the array stay zero.
        let host_extra = match &sets[0] {
            Some(set) => {
                let rows = info.dims()[0];
                let row = set.row_size;
                let lo = dist0.offset.saturating_sub(set.left);
                let hi = min(dist0.offset + dist0.length + set.right, rows);
                let region = HostRegion::new(
                    Arc::clone(info.source()),
                    lo as usize * row,
                    hi.saturating_sub(lo) as usize * row,
                )?;
                let offset = (set.left - (dist0.offset - lo)) as usize * row;

                Some((region, offset))
            }
            None => None,
        };

        {
            let mut state = map.state_mut();
            state.halo = sets;
            if let Some((region, offset)) = host_extra {
                state.host_wextra = Some(region);
                state.host_wextra_offset = offset;
            }
        }

        map.publish(AccessLevel::Halo);
        Ok(())
    }

    fn release_buffer(&self, state: &mut MapState) -> Result {
        if let (true, Some(MemRegion::Device { device, ptr, .. })) =
            (state.owns_buffer, &state.device_wextra)
        {
            self.registry().backend(*device)?.free(*ptr)?;
        }

        state.owns_buffer = false;
        state.device = None;
        state.device_wextra = None;
        Ok(())
    }

    /// Provide device memory for the sub-region. COPY maps and maps with a halo get a buffer
    /// of their own (reused if the size did not change), SHARED maps alias host memory.
    pub fn allocate(&self) -> Result {
        let info = self.info();
        self.require(if info.has_halo() {
            AccessLevel::Halo
        } else {
            AccessLevel::Dist
        })?;

        let map = self.map();
        let device = map.device();
        let mut state = map.state_mut();

        let halo = state.halo.first().cloned().flatten();
        let map_size = state.map_size;

        if state.map_type == Some(MapType::Copy) || halo.is_some() {
            let (left, size) = match &halo {
                Some(h) => (h.left_in.len, h.buffer_size(map_size)),
                None => (0, map_size),
            };

            let reuse = match &state.device_wextra {
                Some(MemRegion::Device { len, .. }) => state.owns_buffer && *len == size,
                _ => false,
            };

            if !reuse {
                self.release_buffer(&mut state)?;

                let ptr = self.registry().backend(device)?.allocate(size)?;
                state.device_wextra = Some(MemRegion::Device {
                    device,
                    ptr,
                    len: size,
                });
                state.owns_buffer = true;
            }

            let core = match &state.device_wextra {
                Some(wextra) => wextra.sub(left, map_size)?,
                None => bail!("{}: device buffer is missing", self),
            };
            state.device = Some(core);
        } else {
            self.release_buffer(&mut state)?;

            let region = match &state.host {
                Some(host) => host.clone(),
                None => HostRegion::whole(Arc::clone(info.source())),
            };

            state.device = Some(MemRegion::Host(region.clone()));
            state.device_wextra = Some(MemRegion::Host(region));
        }

        drop(state);
        map.publish(AccessLevel::Malloc);

        trace!("{}: allocated, {}", self, map);
        Ok(())
    }

    /// Row-major offset in elements of the first element of the sub-region.
    pub fn element_offset(&self) -> u64 {
        element_offset(self.info().dims(), &self.map().state().dist)
    }

    pub fn copy_to_device(&self) -> Result {
        self.copy_to(None)
    }

    /// Submit the copy to `stream`. Non-contiguous maps are marshalled and copied
    /// synchronously.
    pub fn copy_to_device_async(&self, stream: StreamId) -> Result {
        self.copy_to(Some(stream))
    }

    pub fn copy_from_device(&self) -> Result {
        self.copy_from(None)
    }

    pub fn copy_from_device_async(&self, stream: StreamId) -> Result {
        self.copy_from(Some(stream))
    }

    fn transfer(&self, dst: &MemRegion, src: &MemRegion, stream: Option<StreamId>) -> Result {
        match stream {
            Some(stream) => self.registry().copy_async(dst, src, stream),
            None => self.registry().copy(dst, src),
        }
    }

    fn copy_to(&self, stream: Option<StreamId>) -> Result {
        self.require(AccessLevel::Malloc)?;

        if !self.info().direction().copies_to() {
            return Ok(());
        }

        let map = self.map();
        let (owns_buffer, noncontiguous) = {
            let state = map.state();
            (state.owns_buffer, state.noncontiguous)
        };

        if !owns_buffer {
            return Ok(());
        }

        if noncontiguous {
            let packed = match self.marshal()? {
                Some(packed) => packed,
                None => return Ok(()),
            };

            let dst = map
                .device_region()
                .ok_or_else(|| anyhow!("{}: device buffer is missing", self))?;
            return self.registry().copy(&dst, &MemRegion::Host(HostRegion::whole(packed)));
        }

        let (dst, src) = {
            let state = map.state();
            match (&state.device_wextra, &state.host_wextra) {
                (Some(dev), Some(host)) => (
                    dev.sub(state.host_wextra_offset, host.len)?,
                    MemRegion::Host(host.clone()),
                ),
                _ => bail!("{}: map is not allocated", self),
            }
        };

        self.transfer(&dst, &src, stream)
            .with_context(|| format!("failed to copy {} to device", self))
    }

    fn copy_from(&self, stream: Option<StreamId>) -> Result {
        self.require(AccessLevel::Malloc)?;

        if !self.info().direction().copies_from() {
            return Ok(());
        }

        let map = self.map();
        let (owns_buffer, noncontiguous, device, host) = {
            let state = map.state();
            (
                state.owns_buffer,
                state.noncontiguous,
                state.device.clone(),
                state.host.clone(),
            )
        };

        if !owns_buffer {
            return Ok(());
        }

        let device = device.ok_or_else(|| anyhow!("{}: map is not allocated", self))?;

        if noncontiguous {
            if self.info().ndims() != 2 {
                warn!("{}: unmarshalling requires a 2-D array, not copied back", self);
                return Ok(());
            }

            let staging = {
                let mut state = map.state_mut();
                let size = state.map_size;
                let buffer = match &state.marshalled {
                    Some(b) if b.len() == size => Arc::clone(b),
                    _ => HostArray::zeroed(size),
                };
                state.marshalled = Some(Arc::clone(&buffer));
                buffer
            };

            self.registry()
                .copy(&MemRegion::Host(HostRegion::whole(staging)), &device)?;
            return self.unmarshal();
        }

        let host = host.ok_or_else(|| anyhow!("{}: host region is missing", self))?;
        self.transfer(&MemRegion::Host(host), &device, stream)
            .with_context(|| format!("failed to copy {} from device", self))
    }

    /// Release the device buffer if it is owned by this map. Waiting neighbors are woken up
    /// with an error.
    pub fn free(&self) -> Result {
        let map = self.map();
        if map.level().is_none() {
            return Ok(());
        }

        {
            let mut state = map.state_mut();
            for set in state.halo.iter().flatten() {
                set.cancel_relays();
            }

            self.release_buffer(&mut state)?;
            state.marshalled = None;
        }

        map.publish(AccessLevel::Freed);
        trace!("{}: freed", self);
        Ok(())
    }
}

impl PartialEq for MapRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.offload, &other.offload)
            && self.index == other.index
            && self.seqid == other.seqid
    }
}

impl Eq for MapRef {}

impl Debug for MapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapRef")
            .field("offload", &self.offload.name())
            .field("symbol", &self.info().symbol())
            .field("seqid", &self.seqid)
            .field("level", &self.level())
            .finish()
    }
}

impl Display for MapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (device {})",
            self.info().symbol(),
            self.seqid,
            self.device()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datamap::{Edging, MapDirection};
    use crate::distribution::{Alignee, ChunkSize, DistSpec};
    use crate::offload::test::{offload, registry};
    use crate::offload::OffloadInfoBuilder;
    use crate::topology::GridTopology;
    use crate::types::{DeviceKind, MemoryKind, Span};

    #[test]
    fn test_offsets() {
        let dims = [10, 6, 4];
        let results = [
            DistResult {
                offset: 2,
                ..default()
            },
            DistResult {
                offset: 3,
                ..default()
            },
            DistResult {
                offset: 1,
                ..default()
            },
        ];

        assert_eq!(element_offset(&dims, &results), (2 * 6 + 3) * 4 + 1);
        assert_eq!(element_offset(&dims[..1], &results[..1]), 2);
    }

    #[test]
    fn test_contiguous() {
        assert!(is_contiguous(&[10, 4], &[3, 4]));
        assert!(is_contiguous(&[10, 4], &[1, 2]));
        assert!(is_contiguous(&[10, 4], &[0, 2]));
        assert!(!is_contiguous(&[10, 4], &[3, 2]));
        assert!(is_contiguous(&[10, 4, 5], &[1, 1, 3]));
        assert!(!is_contiguous(&[10, 4, 5], &[1, 2, 3]));
        assert!(is_contiguous(&[10, 4, 5], &[2, 4, 5]));
    }

    #[test]
    fn test_lifecycle() {
        let registry = registry(DeviceKind::ThreadSimulated, 2, false);
        let values = (0..40).map(|i| i as f64).collect_vec();
        let source = HostArray::from_values(&values);

        let info = DataMapInfo::new(
            "a",
            Arc::clone(&source),
            &[10, 4],
            8,
            MapDirection::ToFrom,
            MapType::Auto,
        )
        .unwrap()
        .dist_init(0, DistSpec::block(0..10))
        .unwrap();

        let offload = offload(&registry, vec![info]);
        let map = offload.map_ref(0, 1).unwrap();
        assert_eq!(map.level(), None);

        // levels can only be reached in order
        assert!(map.distribute().is_err());

        let mut levels = vec![];
        map.init().unwrap();
        levels.push(map.level());
        assert_eq!(map.map().resolved_type(), Some(MapType::Copy));

        assert_eq!(map.distribute().unwrap(), 20);
        levels.push(map.level());
        assert_eq!(map.element_offset(), 20);
        assert_eq!(map.map().map_size(), 160);

        map.setup_halo().unwrap();
        levels.push(map.level());

        map.allocate().unwrap();
        levels.push(map.level());
        assert!(map.map().to_string().ends_with("160 bytes"));

        map.copy_to_device().unwrap();
        let device = map.map().device_region().unwrap();
        let on_device = registry.read(&device).unwrap();
        assert_eq!(on_device, HostArray::from_values(&values[20..]).with(|b| b.to_vec()));

        // modify on device, copy back
        let doubled = values[20..].iter().map(|v| v * 2.0).collect_vec();
        registry
            .write(&device, &HostArray::from_values(&doubled).with(|b| b.to_vec()))
            .unwrap();
        map.copy_from_device().unwrap();

        let result = source.to_values::<f64>().unwrap();
        assert_eq!(&result[..20], &values[..20]);
        assert_eq!(&result[20..], &doubled[..]);

        map.free().unwrap();
        levels.push(map.level());

        assert_eq!(
            levels,
            [
                Some(AccessLevel::Init),
                Some(AccessLevel::Dist),
                Some(AccessLevel::Dist),
                Some(AccessLevel::Malloc),
                Some(AccessLevel::Freed)
            ]
        );
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_shared() {
        let registry = registry(DeviceKind::HostCpu, 1, true);
        let source = HostArray::zeroed(8 * 16);

        let info = DataMapInfo::new(
            "s",
            Arc::clone(&source),
            &[16],
            8,
            MapDirection::To,
            MapType::Auto,
        )
        .unwrap();

        let offload = offload(&registry, vec![info]);
        let map = offload.map_ref(0, 0).unwrap();
        map.init().unwrap();
        assert_eq!(map.map().resolved_type(), Some(MapType::Shared));
        assert_eq!(map.distribute().unwrap(), 16);
        map.allocate().unwrap();

        // device memory aliases the host array
        match map.map().device_region().unwrap() {
            MemRegion::Host(region) => assert!(Arc::ptr_eq(&region.buffer, &source)),
            other => panic!("expected host memory, got {:?}", other),
        }

        map.copy_to_device().unwrap();
        map.free().unwrap();
        assert_eq!(registry.device(DeviceId::new(0)).unwrap().memory(), MemoryKind::Shared);
    }

    #[test]
    fn test_shared_on_discrete() {
        let registry = registry(DeviceKind::ThreadSimulated, 1, false);
        let info = DataMapInfo::new(
            "d",
            HostArray::zeroed(8),
            &[1],
            8,
            MapDirection::Alloc,
            MapType::Shared,
        )
        .unwrap();

        let offload = offload(&registry, vec![info]);
        let map = offload.map_ref(0, 0).unwrap();
        map.init().unwrap();
        assert_eq!(map.map().resolved_type(), Some(MapType::Copy));
    }

    #[test]
    fn test_halo_host_rows() {
        let registry = registry(DeviceKind::ThreadSimulated, 2, true);
        let values = (0..24).map(|i| i as f32).collect_vec();
        let source = HostArray::from_values(&values);

        let info = DataMapInfo::new(
            "h",
            Arc::clone(&source),
            &[6, 4],
            4,
            MapDirection::To,
            MapType::Copy,
        )
        .unwrap()
        .dist_init(0, DistSpec::block(0..6))
        .unwrap()
        .add_halo(0, 1, 1, Edging::None)
        .unwrap();

        let offload = offload(&registry, vec![info]);

        // position 0 has rows 0..3; only the right halo row exists in the host array
        let map = offload.map_ref(0, 0).unwrap();
        map.init().unwrap();
        map.distribute().unwrap();
        map.setup_halo().unwrap();
        assert_eq!(map.level(), Some(AccessLevel::Halo));
        map.allocate().unwrap();
        map.copy_to_device().unwrap();

        let wextra = map.map().device_region_wextra().unwrap();
        assert_eq!(wextra.len(), (3 + 2) * 16);

        let bytes = registry.read(&wextra).unwrap();
        let expected = HostArray::from_values(&values[..16]).with(|b| b.to_vec());
        assert_eq!(&bytes[..16], &[0; 16][..]);
        assert_eq!(&bytes[16..], &expected[..]);

        let set = map.map().halo_set(0).unwrap();
        assert_eq!(set.left_neighbor, None);
        assert_eq!(set.right_neighbor, Some(1));
        assert!(set.right_relay.is_none());
    }

    #[test]
    fn test_redistribute_after_allocate() {
        let registry = registry(DeviceKind::ThreadSimulated, 2, true);
        let mut builder =
            OffloadInfoBuilder::new("redist", &registry, GridTopology::simple(2, 1).unwrap());

        let level = builder.loop_dist(DistSpec::cyclic(0..20, ChunkSize::Absolute(2)));
        let index = builder.map(
            DataMapInfo::new(
                "r",
                HostArray::zeroed(20 * 8),
                &[20],
                8,
                MapDirection::ToFrom,
                MapType::Copy,
            )
            .unwrap()
            .align(0, Alignee::loop_level(level))
            .unwrap()
            .add_halo(0, 1, 1, Edging::None)
            .unwrap(),
        );
        let offload = builder.build().unwrap();

        let map = offload.map_ref(index, 1).unwrap();
        map.init().unwrap();

        assert_eq!(offload.distribute_loop(level, 1).unwrap(), Span::new(2, 2));
        map.distribute().unwrap();
        map.setup_halo().unwrap();
        map.allocate().unwrap();
        assert_eq!(map.level(), Some(AccessLevel::Malloc));
        assert_eq!(map.element_offset(), 2);

        let wextra = map.map().device_region_wextra().unwrap();
        assert_eq!(wextra.len(), (1 + 2 + 1) * 8);

        // the next chunk of the loop moves the map; nothing of the old layout stays published
        assert_eq!(offload.distribute_loop(level, 1).unwrap(), Span::new(6, 2));
        map.distribute().unwrap();
        assert_eq!(map.level(), Some(AccessLevel::Dist));
        assert_eq!(map.map().dist_results()[0].span(), Span::new(6, 2));
        assert_eq!(map.element_offset(), 6);
        assert!(map.map().device_region().is_none());
        assert!(map.map().halo_set(0).is_none());
        assert!(map.copy_to_device().is_err());

        map.setup_halo().unwrap();
        map.allocate().unwrap();
        assert_eq!(map.level(), Some(AccessLevel::Malloc));
        assert_eq!(map.map().device_region().unwrap().len(), 2 * 8);

        // same size, so the buffer is reused
        let reused = map.map().device_region_wextra().unwrap();
        assert_eq!(format!("{:?}", reused), format!("{:?}", wextra));
        map.free().unwrap();
    }
}
