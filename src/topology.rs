//! Rectangular grids of devices.
//!
//! A [`GridTopology`] arranges `nnodes` devices as the points of a grid of at most
//! [`MAX_DIMS`] dimensions. Each point has a *sequence id* (its row-major index in the grid)
//! and is backed by one device of the registry (`idmap[seqid]`).
use std::fmt::{self, Display};

use crate::prelude::*;
use crate::types::{DeviceId, SeqId, MAX_DIMS};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology must have between 1 and {} dimensions, got {0}", MAX_DIMS)]
    InvalidDims(usize),

    #[error("topology must contain at least one device")]
    Empty,

    #[error("device {0} appears more than once in the topology")]
    DuplicateDevice(DeviceId),

    #[error("shape {0:?} does not match {1} devices")]
    ShapeMismatch(Vec<usize>, usize),

    #[error("axis {0} is out of range for a {1}-dimensional topology")]
    InvalidAxis(usize, usize),
}

/// Split `n` into `ndims` factors whose product is `n`.
///
/// Among all such splits the one with the smallest largest factor is chosen (ties are broken
/// by the second largest factor), so the resulting grid is as square as possible. Factors are
/// returned in non-increasing order, e.g. `factor(12, 2) == [4, 3]` and
/// `factor(8, 3) == [2, 2, 2]`. Primes yield the degenerate shape `[n, 1, ...]`.
pub fn factor(n: usize, ndims: usize) -> Result<DimVec<usize>, TopologyError> {
    if ndims == 0 || ndims > MAX_DIMS {
        return Err(TopologyError::InvalidDims(ndims));
    }

    if n == 0 {
        return Err(TopologyError::Empty);
    }

    let divisors = shepherd_core::util::divisors(n as u64);
    let mut best: Option<DimVec<usize>> = None;

    let mut consider = |mut shape: DimVec<usize>| {
        shape.sort_unstable_by(|a, b| b.cmp(a));

        let better = match &best {
            None => true,
            Some(current) => shape.as_slice() < current.as_slice(),
        };

        if better {
            best = Some(shape);
        }
    };

    match ndims {
        1 => consider([n].iter().copied().collect()),
        2 => {
            for &a in &divisors {
                let a = a as usize;
                consider([a, n / a].iter().copied().collect());
            }
        }
        _ => {
            for &a in &divisors {
                for &b in &divisors {
                    let (a, b) = (a as usize, b as usize);
                    if (n / a) % b == 0 {
                        consider([a, b, n / a / b].iter().copied().collect());
                    }
                }
            }
        }
    }

    // `divisors` always contains 1, so at least one shape has been considered.
    best.ok_or(TopologyError::Empty)
}

/// Devices arranged as points of a (optionally periodic) rectangular grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridTopology {
    dims: DimVec<usize>,
    periodic: DimVec<bool>,
    idmap: Vec<DeviceId>,
}

impl GridTopology {
    /// Create a topology of the given devices, where the grid shape is obtained by
    /// factorizing the number of devices into `ndims` factors.
    pub fn new(devices: &[DeviceId], ndims: usize) -> Result<Self, TopologyError> {
        let dims = factor(devices.len(), ndims)?;
        Self::with_shape(devices, &dims)
    }

    /// Topology of `ndevs` devices with device ids `0..ndevs`.
    pub fn simple(ndevs: usize, ndims: usize) -> Result<Self, TopologyError> {
        let devices = (0..ndevs).map(DeviceId::new).collect_vec();
        Self::new(&devices, ndims)
    }

    /// Create a topology with an explicit grid shape.
    pub fn with_shape(devices: &[DeviceId], shape: &[usize]) -> Result<Self, TopologyError> {
        if shape.is_empty() || shape.len() > MAX_DIMS {
            return Err(TopologyError::InvalidDims(shape.len()));
        }

        if devices.is_empty() {
            return Err(TopologyError::Empty);
        }

        if shape.iter().product::<usize>() != devices.len() {
            return Err(TopologyError::ShapeMismatch(shape.to_vec(), devices.len()));
        }

        let mut seen = HashSet::default();
        for &id in devices {
            if !seen.insert(id) {
                return Err(TopologyError::DuplicateDevice(id));
            }
        }

        Ok(Self {
            dims: shape.iter().copied().collect(),
            periodic: shape.iter().map(|_| false).collect(),
            idmap: devices.to_vec(),
        })
    }

    /// Enable or disable wraparound along `axis`.
    pub fn with_periodic(mut self, axis: usize, periodic: bool) -> Result<Self, TopologyError> {
        if axis >= self.ndims() {
            return Err(TopologyError::InvalidAxis(axis, self.ndims()));
        }

        self.periodic[axis] = periodic;
        Ok(self)
    }

    #[inline]
    pub fn nnodes(&self) -> usize {
        self.idmap.len()
    }

    #[inline]
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of grid positions along `axis`. Axes beyond the topology's rank have extent one.
    #[inline]
    pub fn extent(&self, axis: usize) -> usize {
        self.dims.get(axis).copied().unwrap_or(1)
    }

    #[inline]
    pub fn is_periodic(&self, axis: usize) -> bool {
        self.periodic.get(axis).copied().unwrap_or(false)
    }

    #[inline]
    pub fn idmap(&self) -> &[DeviceId] {
        &self.idmap
    }

    /// The device at grid position `seqid`.
    ///
    /// # Panics
    /// If `seqid` is out of range.
    #[inline]
    pub fn device(&self, seqid: SeqId) -> DeviceId {
        self.idmap[seqid]
    }

    /// Returns the sequence id of the given device, or `None` if it is not part of this
    /// topology.
    pub fn seqid_of(&self, device: DeviceId) -> Option<SeqId> {
        self.idmap.iter().position(|&d| d == device)
    }

    /// Mixed-radix (row-major) coordinates of `seqid`.
    pub fn coords_of(&self, seqid: SeqId) -> DimVec<usize> {
        let mut coords = DimVec::new();
        let mut stride = self.nnodes();
        let mut rest = seqid;

        for &extent in &self.dims {
            stride /= extent;
            coords.push(rest / stride);
            rest %= stride;
        }

        coords
    }

    /// Inverse of [`GridTopology::coords_of`].
    pub fn seqid_at(&self, coords: &[usize]) -> SeqId {
        let mut seqid = 0;
        let mut stride = 1;

        for (&c, &extent) in zip(coords, &self.dims).rev() {
            seqid += stride * c;
            stride *= extent;
        }

        seqid
    }

    /// Position along `axis` of `seqid` (zero for axes beyond the topology's rank).
    pub fn coord(&self, seqid: SeqId, axis: usize) -> usize {
        self.coords_of(seqid).get(axis).copied().unwrap_or(0)
    }

    /// Left and right neighbors of `seqid` along `axis`, wrapping around if the axis is
    /// periodic.
    pub fn neighbors(&self, seqid: SeqId, axis: usize) -> (Option<SeqId>, Option<SeqId>) {
        self.neighbors_cyclic(seqid, axis, self.is_periodic(axis))
    }

    /// Left and right neighbors of `seqid` along `axis`. A missing neighbor is reported as
    /// `None`, which only happens at the edges of a non-cyclic axis.
    pub fn neighbors_cyclic(
        &self,
        seqid: SeqId,
        axis: usize,
        cyclic: bool,
    ) -> (Option<SeqId>, Option<SeqId>) {
        if seqid >= self.nnodes() || axis >= self.ndims() {
            return (None, None);
        }

        let mut coords = self.coords_of(seqid);
        let extent = self.dims[axis];
        let c = coords[axis];

        let left = if c > 0 {
            Some(c - 1)
        } else if cyclic {
            Some(extent - 1)
        } else {
            None
        };

        let right = if c + 1 < extent {
            Some(c + 1)
        } else if cyclic {
            Some(0)
        } else {
            None
        };

        let mut at = |v: Option<usize>| {
            v.map(|v| {
                coords[axis] = v;
                self.seqid_at(&coords)
            })
        };

        let left = at(left);
        let right = at(right);
        (left, right)
    }
}

impl Display for GridTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topology ({}): ", self.nnodes())?;
        for (&d, &p) in zip(&self.dims, &self.periodic) {
            write!(f, "[{}{}]", d, if p { "*" } else { "" })?;
        }

        write!(
            f,
            " {}",
            self.idmap
                .iter()
                .enumerate()
                .map(|(s, d)| format!("{}->{}", s, d))
                .join(", ")
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids(n: u32) -> Vec<DeviceId> {
        (0..n).map(DeviceId).collect()
    }

    #[test]
    fn test_factor() {
        for n in 1..=64 {
            for ndims in 1..=3 {
                let f = factor(n, ndims).unwrap();
                assert_eq!(f.len(), ndims);
                assert_eq!(f.iter().product::<usize>(), n, "factor({}, {})", n, ndims);
            }
        }

        assert_eq!(factor(6, 2).unwrap().as_slice(), &[3, 2]);
        assert_eq!(factor(12, 2).unwrap().as_slice(), &[4, 3]);
        assert_eq!(factor(16, 2).unwrap().as_slice(), &[4, 4]);
        assert_eq!(factor(13, 2).unwrap().as_slice(), &[13, 1]);
        assert_eq!(factor(8, 3).unwrap().as_slice(), &[2, 2, 2]);
        assert_eq!(factor(6, 3).unwrap().as_slice(), &[3, 2, 1]);
        assert_eq!(factor(7, 3).unwrap().as_slice(), &[7, 1, 1]);

        assert_eq!(factor(4, 4), Err(TopologyError::InvalidDims(4)));
        assert_eq!(factor(0, 2), Err(TopologyError::Empty));
    }

    #[test]
    fn test_init() {
        let devices = vec![DeviceId(7), DeviceId(3), DeviceId(5), DeviceId(1)];
        let top = GridTopology::new(&devices, 2).unwrap();

        assert_eq!(top.nnodes(), 4);
        assert_eq!(top.dims().iter().product::<usize>(), 4);

        let mut seen = HashSet::default();
        for &d in top.idmap() {
            assert!(devices.contains(&d));
            assert!(seen.insert(d));
        }

        for s in 0..top.nnodes() {
            assert_eq!(top.seqid_of(top.idmap()[s]), Some(s));
        }

        assert_eq!(top.seqid_of(DeviceId(0)), None);

        assert_eq!(
            GridTopology::new(&[DeviceId(1), DeviceId(1)], 1),
            Err(TopologyError::DuplicateDevice(DeviceId(1)))
        );
    }

    #[test]
    fn test_coords_roundtrip() {
        let top = GridTopology::new(&ids(6), 2).unwrap();
        assert_eq!(top.dims()[0] * top.dims()[1], 6);

        for s in 0..6 {
            let coords = top.coords_of(s);
            assert_eq!(top.seqid_at(&coords), s);
            assert_eq!(top.coords_of(top.seqid_at(&coords)), coords);
        }

        let top = GridTopology::with_shape(&ids(24), &[2, 3, 4]).unwrap();
        assert_eq!(top.coords_of(23).as_slice(), &[1, 2, 3]);
        assert_eq!(top.seqid_at(&[1, 0, 2]), 14);

        for s in 0..24 {
            assert_eq!(top.seqid_at(&top.coords_of(s)), s);
        }
    }

    #[test]
    fn test_coords_all_sizes() {
        for n in 1..=64 {
            for ndims in 1..=3 {
                let top = GridTopology::simple(n, ndims).unwrap();
                assert_eq!(top.ndims(), ndims);
                assert_eq!(top.dims().iter().product::<usize>(), n, "{} devices", n);

                let mut seen = HashSet::default();
                for s in 0..n {
                    let coords = top.coords_of(s);
                    assert!(all(zip(&coords, top.dims()), |(c, d)| c < d));
                    assert!(seen.insert(coords.clone()), "{:?} of {}", coords, top);
                    assert_eq!(top.seqid_at(&coords), s, "{:?} of {}", coords, top);
                }
            }
        }
    }

    #[test]
    fn test_neighbors() {
        let top = GridTopology::simple(4, 1).unwrap();
        assert_eq!(top.neighbors(0, 0), (None, Some(1)));
        assert_eq!(top.neighbors(2, 0), (Some(1), Some(3)));
        assert_eq!(top.neighbors(3, 0), (Some(2), None));

        let top = top.with_periodic(0, true).unwrap();
        assert_eq!(top.neighbors(0, 0), (Some(3), Some(1)));
        assert_eq!(top.neighbors(3, 0), (Some(2), Some(0)));

        // 3x2 grid: seqid = 2 * row + col
        let top = GridTopology::with_shape(&ids(6), &[3, 2]).unwrap();
        assert_eq!(top.neighbors(2, 0), (Some(0), Some(4)));
        assert_eq!(top.neighbors(2, 1), (None, Some(3)));
        assert_eq!(top.neighbors_cyclic(2, 1, true), (Some(3), Some(3)));
        assert_eq!(top.neighbors(6, 0), (None, None));

        let single = GridTopology::simple(1, 1).unwrap();
        assert_eq!(single.neighbors_cyclic(0, 0, true), (Some(0), Some(0)));
    }
}
