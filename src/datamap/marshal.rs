use super::{MapError, MapRef};
use crate::device::{HostArray, HostBuffer};
use crate::prelude::*;

/// Copy `nrows` rows of `row_len` bytes, `stride` bytes apart starting at `offset` in `src`,
/// into consecutive rows of `dst`.
fn pack_rows(dst: &mut [u8], src: &[u8], offset: usize, stride: usize, row_len: usize) {
    for (i, row) in enumerate(dst.chunks_exact_mut(row_len)) {
        let start = offset + i * stride;
        row.copy_from_slice(&src[start..start + row_len]);
    }
}

/// Inverse of [`pack_rows`].
fn scatter_rows(dst: &mut [u8], src: &[u8], offset: usize, stride: usize, row_len: usize) {
    for (i, row) in enumerate(src.chunks_exact(row_len)) {
        let start = offset + i * stride;
        dst[start..start + row_len].copy_from_slice(row);
    }
}

impl MapRef {
    /// Layout of a 2-D sub-region inside the host array: `(offset, stride, row_len, nrows)` in
    /// bytes. `None` for other ranks.
    fn row_layout(&self) -> Option<(usize, usize, usize, usize)> {
        let info = self.info();
        if info.ndims() != 2 {
            return None;
        }

        let elem = info.elem_size();
        let dist = self.map().dist_results();
        let offset = self.element_offset() as usize * elem;
        let stride = info.dims()[1] as usize * elem;
        let row_len = dist[1].length as usize * elem;

        Some((offset, stride, row_len, dist[0].length as usize))
    }

    /// Pack the sub-region of a non-contiguous 2-D map into a contiguous host buffer. Other
    /// ranks are not supported and return `None`.
    pub fn marshal(&self) -> Result<Option<HostBuffer>> {
        self.require(super::AccessLevel::Dist)?;

        let (offset, stride, row_len, nrows) = match self.row_layout() {
            Some(layout) => layout,
            None => {
                warn!(
                    "{}: marshalling a {}-D array is not supported",
                    self,
                    self.info().ndims()
                );
                return Ok(None);
            }
        };

        let packed = HostArray::zeroed(nrows * row_len);
        if row_len > 0 {
            let source = self.info().source();
            packed.with_mut(|dst| {
                source.with(|src| pack_rows(dst, src, offset, stride, row_len));
            });
        }

        self.map().state_mut().marshalled = Some(Arc::clone(&packed));
        trace!("{}: marshalled {} rows of {} bytes", self, nrows, row_len);

        Ok(Some(packed))
    }

    /// Scatter the marshalled buffer back into the host array.
    pub fn unmarshal(&self) -> Result {
        let packed = match self.map().state().marshalled.clone() {
            Some(packed) => packed,
            None => {
                return Err(MapError::NotMarshalled {
                    symbol: self.info().symbol().to_string(),
                    seqid: self.seqid(),
                }
                .into())
            }
        };

        let (offset, stride, row_len, nrows) = match self.row_layout() {
            Some(layout) => layout,
            None => {
                warn!(
                    "{}: unmarshalling a {}-D array is not supported",
                    self,
                    self.info().ndims()
                );
                return Ok(());
            }
        };

        ensure!(
            packed.len() == nrows * row_len,
            "{}: marshalled buffer has {} bytes, expected {}",
            self,
            packed.len(),
            nrows * row_len
        );

        if row_len > 0 {
            let source = self.info().source();
            packed.with(|src| {
                source.with_mut(|dst| scatter_rows(dst, src, offset, stride, row_len));
            });
        }

        trace!("{}: unmarshalled {} rows of {} bytes", self, nrows, row_len);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datamap::{AccessLevel, DataMapInfo, MapDirection, MapType};
    use crate::distribution::DistSpec;
    use crate::offload::test::{offload, registry};
    use crate::types::DeviceKind;

    #[test]
    fn test_rows() {
        let src = (0u8..20).collect_vec();
        let mut packed = vec![0; 6];

        // 3 rows of 2 bytes, starting at byte 1, rows 5 bytes apart
        pack_rows(&mut packed, &src, 1, 5, 2);
        assert_eq!(packed, [1, 2, 6, 7, 11, 12]);

        let mut dst = vec![0u8; 20];
        scatter_rows(&mut dst, &packed, 1, 5, 2);
        assert_eq!(&dst[..13], &[0, 1, 2, 0, 0, 0, 6, 7, 0, 0, 0, 11, 12]);
    }

    #[test]
    fn test_marshal_roundtrip() {
        let registry = registry(DeviceKind::ThreadSimulated, 4, true);
        let values = (0..48).map(|i| i as u32).collect_vec();
        let source = HostArray::from_values(&values);

        // 6x8 array, both dimensions split over a 2x2 grid
        let info = DataMapInfo::new(
            "m",
            Arc::clone(&source),
            &[6, 8],
            4,
            MapDirection::ToFrom,
            MapType::Copy,
        )
        .unwrap()
        .dist_init(0, DistSpec::block(0..6).axis(0))
        .unwrap()
        .dist_init(1, DistSpec::block(0..8).axis(1))
        .unwrap();

        let offload = offload(&registry, vec![info]);
        assert_eq!(offload.topology().dims(), &[2, 2]);

        // position 3 owns rows 3..6 and columns 4..8
        let map = offload.map_ref(0, 3).unwrap();
        assert!(map.marshal().is_err());

        map.init().unwrap();
        assert_eq!(map.distribute().unwrap(), 12);
        assert!(map.map().is_noncontiguous());
        assert!(map.unmarshal().is_err());

        let packed = map.marshal().unwrap().unwrap();
        let expected = [28, 29, 30, 31, 36, 37, 38, 39, 44, 45, 46, 47];
        assert_eq!(packed.to_values::<u32>().unwrap(), expected);

        // round trip through the device
        map.allocate().unwrap();
        assert_eq!(map.level(), Some(AccessLevel::Malloc));
        map.copy_to_device().unwrap();

        let device = map.map().device_region().unwrap();
        let shifted = expected.iter().map(|&v| v + 1000).collect_vec();
        registry
            .write(&device, &HostArray::from_values(&shifted).with(|b| b.to_vec()))
            .unwrap();
        map.copy_from_device().unwrap();

        let result = source.to_values::<u32>().unwrap();
        for (i, (&got, &orig)) in enumerate(zip(&result, &values)) {
            let (row, col) = (i / 8, i % 8);
            if row >= 3 && col >= 4 {
                assert_eq!(got, orig + 1000);
            } else {
                assert_eq!(got, orig);
            }
        }
    }

    #[test]
    fn test_marshal_unsupported_rank() {
        let registry = registry(DeviceKind::ThreadSimulated, 1, true);
        let info = DataMapInfo::new(
            "v",
            HostArray::zeroed(4 * 10),
            &[10],
            4,
            MapDirection::To,
            MapType::Copy,
        )
        .unwrap();

        let offload = offload(&registry, vec![info]);
        let map = offload.map_ref(0, 0).unwrap();
        map.init().unwrap();
        map.distribute().unwrap();
        assert!(map.marshal().unwrap().is_none());
    }
}
